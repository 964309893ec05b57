//! Cluster metadata descriptors parsed from the administrative info protocol.
//!
//! Info responses are semicolon-separated records; each record is a list of `key=value`
//! pairs joined by `:` (indexes, sets) or `,` (modules).

pub mod cache;

use crate::errors::{QueryError, QueryResult};
use crate::store::NativeFilter;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bson::Bson;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    String,
    Numeric,
}

impl IndexType {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRING" | "TEXT" => Some(Self::String),
            "NUMERIC" | "INTEGER" | "INT SIGNED" => Some(Self::Numeric),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Numeric => "NUMERIC",
        }
    }

    /// Whether an index of this type can evaluate the filter.
    #[must_use]
    pub fn accepts(self, filter: &NativeFilter) -> bool {
        match (self, filter) {
            (Self::String, NativeFilter::Equal { value: Bson::String(_), .. }) => true,
            (Self::Numeric, NativeFilter::Equal { value: Bson::Int32(_) | Bson::Int64(_), .. }) => true,
            (Self::Numeric, NativeFilter::Range { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits `k1=v1<sep>k2=v2` into a map; fragments without `=` are ignored.
#[must_use]
pub fn parse_pairs(record: &str, sep: char) -> BTreeMap<String, String> {
    record
        .split(sep)
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(';').map(str::trim).filter(|r| !r.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub bin_name: String,
    pub index_name: String,
    pub namespace: String,
    pub set: Option<String>,
    pub index_type: IndexType,
    /// Every field the node reported, verbatim.
    pub properties: BTreeMap<String, String>,
}

impl IndexDescriptor {
    /// Parses one `sindex` record, e.g.
    /// `ns=test:set=people:indexname=age_idx:num_bins=1:bins=age:type=NUMERIC:state=RW`.
    #[must_use]
    pub fn from_info(record: &str) -> Option<Self> {
        let properties = parse_pairs(record, ':');
        let bin_name = properties.get("bins").or_else(|| properties.get("bin"))?.clone();
        let index_name = properties.get("indexname")?.clone();
        let index_type = IndexType::parse(properties.get("type")?)?;
        let namespace = properties.get("ns").cloned().unwrap_or_default();
        let set = properties
            .get("set")
            .filter(|s| !s.is_empty() && s.as_str() != "NULL")
            .cloned();
        Some(Self { bin_name, index_name, namespace, set, index_type, properties })
    }
}

/// Parses a full `sindex` response; unparseable records are skipped.
#[must_use]
pub fn parse_indexes(text: &str) -> Vec<IndexDescriptor> {
    records(text)
        .filter_map(|r| {
            let parsed = IndexDescriptor::from_info(r);
            if parsed.is_none() {
                log::debug!("skipping unrecognised index record: {r}");
            }
            parsed
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDescriptor {
    pub name: String,
    pub objects: u64,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDescriptor {
    pub name: String,
    pub properties: BTreeMap<String, String>,
    pub sets: Vec<SetDescriptor>,
}

impl NamespaceDescriptor {
    /// Builds a descriptor from the `namespace/<ns>` and `sets/<ns>` responses.
    #[must_use]
    pub fn from_info(name: &str, detail: &str, sets: &str) -> Self {
        let properties = parse_pairs(detail, ';');
        let sets = records(sets)
            .filter_map(|r| {
                let props = parse_pairs(r, ':');
                let set_name = props.get("set").or_else(|| props.get("set_name"))?.clone();
                let objects = props.get("objects").and_then(|n| n.parse().ok()).unwrap_or(0);
                Some(SetDescriptor { name: set_name, objects, properties: props })
            })
            .collect();
        Self { name: name.to_string(), properties, sets }
    }

    #[must_use]
    pub fn objects(&self) -> Option<u64> {
        self.properties.get("objects").and_then(|n| n.parse().ok())
    }

    #[must_use]
    pub fn set(&self, name: &str) -> Option<&SetDescriptor> {
        self.sets.iter().find(|s| s.name == name)
    }
}

/// Parses the `namespaces` response into names.
#[must_use]
pub fn parse_namespace_names(text: &str) -> Vec<String> {
    records(text).map(str::to_string).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// File name without its extension; the name aggregation calls refer to.
    pub name: String,
    pub file_name: String,
    pub hash: String,
    pub language: String,
    pub properties: BTreeMap<String, String>,
}

impl ModuleDescriptor {
    /// Parses one `udf-list` record, e.g. `filename=as_utility.lua,hash=ab12,type=LUA`.
    #[must_use]
    pub fn from_info(record: &str) -> Option<Self> {
        let properties = parse_pairs(record, ',');
        let file_name = properties.get("filename")?.clone();
        let name = module_name(&file_name).to_string();
        let hash = properties.get("hash").cloned().unwrap_or_default();
        let language = properties.get("type").cloned().unwrap_or_else(|| "LUA".into());
        Some(Self { name, file_name, hash, language, properties })
    }
}

/// `as_utility.lua` -> `as_utility`.
#[must_use]
pub fn module_name(file_name: &str) -> &str {
    file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem)
}

#[must_use]
pub fn parse_modules(text: &str) -> Vec<ModuleDescriptor> {
    records(text).filter_map(ModuleDescriptor::from_info).collect()
}

/// Decodes a `udf-get` response. `Ok(None)` when the node reports the module missing.
///
/// # Errors
/// `Store` when the content field is missing or not valid base64 UTF-8.
pub fn parse_module_content(text: &str) -> QueryResult<Option<String>> {
    let props = parse_pairs(text, ';');
    if props.contains_key("error") {
        return Ok(None);
    }
    let content = props
        .get("content")
        .ok_or_else(|| QueryError::Store("module response has no content".into()))?;
    let bytes = B64
        .decode(content)
        .map_err(|e| QueryError::Store(format!("module content is not base64: {e}")))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| QueryError::Store(format!("module content is not UTF-8: {e}")))
}

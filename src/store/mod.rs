//! Store protocol consumed by the engine.
//!
//! The engine never talks to the wire directly; everything goes through [`StoreClient`].
//! [`memory::MemoryStore`] is an in-process cluster implementing the same contract.

pub mod memory;
pub mod script;

use crate::errors::{QueryError, QueryResult};
use bson::{Bson, Document as BsonDocument};
use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_LEN: usize = 20;

/// Fixed-size record address derived from set name and user key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    #[must_use]
    pub fn compute(set: Option<&str>, user_key: &Bson) -> Option<Self> {
        let (tag, bytes): (u8, Vec<u8>) = match user_key {
            Bson::Int32(i) => (1, i64::from(*i).to_be_bytes().to_vec()),
            Bson::Int64(i) => (1, i.to_be_bytes().to_vec()),
            Bson::String(s) => (3, s.as_bytes().to_vec()),
            Bson::Binary(b) => (4, b.bytes.clone()),
            _ => return None,
        };
        let mut h = Sha256::new();
        h.update(set.unwrap_or("").as_bytes());
        h.update([tag]);
        h.update(&bytes);
        let full = h.finalize();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&full[..DIGEST_LEN]);
        Some(Self(out))
    }

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; DIGEST_LEN]>::try_from(bytes).ok().map(Self)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Record address: namespace, optional set, and digest. The user key is kept when known.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub namespace: String,
    pub set: Option<String>,
    pub user_key: Option<Bson>,
    pub digest: Digest,
}

impl Key {
    /// # Errors
    /// Returns `InvalidArgument` when the user key is not an integer, string or blob.
    pub fn new(namespace: &str, set: Option<&str>, user_key: Bson) -> QueryResult<Self> {
        let digest = Digest::compute(set, &user_key).ok_or_else(|| {
            QueryError::InvalidArgument(format!("unsupported user key type: {user_key:?}"))
        })?;
        Ok(Self {
            namespace: namespace.to_string(),
            set: set.map(str::to_string),
            user_key: Some(user_key),
            digest,
        })
    }

    #[must_use]
    pub fn from_digest(namespace: &str, set: Option<&str>, digest: Digest) -> Self {
        Self {
            namespace: namespace.to_string(),
            set: set.map(str::to_string),
            user_key: None,
            digest,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.set.as_deref().unwrap_or(""), self.digest)
    }
}

/// A named value written to a record. Writing `Bson::Null` removes the bin.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Bson,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub bins: BsonDocument,
    pub generation: u32,
    /// Seconds until expiry; 0 means never.
    pub expiration: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub key: Key,
    pub record: Record,
}

/// Filter the store evaluates natively against a secondary index.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeFilter {
    Equal { bin: String, value: Bson },
    Range { bin: String, begin: i64, end: i64 },
}

impl NativeFilter {
    #[must_use]
    pub fn bin(&self) -> &str {
        match self {
            Self::Equal { bin, .. } | Self::Range { bin, .. } => bin,
        }
    }
}

/// A query specification over one namespace/set.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub namespace: String,
    pub set: Option<String>,
    pub filter: Option<NativeFilter>,
    pub bin_names: Option<Vec<String>>,
    /// When false the store returns record headers only.
    pub include_bin_data: bool,
}

impl Statement {
    pub fn new(namespace: impl Into<String>, set: Option<&str>) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.map(str::to_string),
            filter: None,
            bin_names: None,
            include_bin_data: true,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: NativeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_bins<I, S>(mut self, bins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bin_names = Some(bins.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationPolicy {
    #[default]
    None,
    ExpectEqual(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordExistsAction {
    /// Create or merge bins into an existing record.
    #[default]
    Update,
    UpdateOnly,
    CreateOnly,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePolicy {
    pub generation: GenerationPolicy,
    pub exists: RecordExistsAction,
    pub send_key: bool,
    pub expiration: Option<u32>,
}

/// Invocation of a registered server-side aggregation entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub module: String,
    pub function: String,
    pub args: BsonDocument,
}

/// Streaming cursor over native query results.
pub trait RecordCursor: Send {
    /// # Errors
    /// Propagates network or server failures for the next page.
    fn next_record(&mut self) -> QueryResult<Option<KeyRecord>>;
    fn close(&mut self);
}

/// Streaming cursor over values emitted by a server-side aggregation.
pub trait ValueCursor: Send {
    /// # Errors
    /// Propagates network or server failures for the next page.
    fn next_value(&mut self) -> QueryResult<Option<Bson>>;
    fn close(&mut self);
}

/// Blocking client for the underlying key-value store.
pub trait StoreClient: Send + Sync {
    /// Names of the nodes the client currently knows about.
    fn node_names(&self) -> Vec<String>;

    /// Administrative text command against one node.
    fn info(&self, node: &str, command: &str) -> QueryResult<String>;

    fn get(&self, key: &Key, bins: Option<&[String]>) -> QueryResult<Option<Record>>;

    fn get_header(&self, key: &Key) -> QueryResult<Option<Record>>;

    fn exists(&self, key: &Key) -> QueryResult<bool>;

    fn get_batch(&self, keys: &[Key]) -> QueryResult<Vec<Option<Record>>>;

    fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> QueryResult<()>;

    /// Returns whether the record existed.
    fn delete(&self, policy: &WritePolicy, key: &Key) -> QueryResult<bool>;

    fn query(&self, statement: &Statement) -> QueryResult<Box<dyn RecordCursor>>;

    fn query_aggregate(
        &self,
        statement: &Statement,
        call: &AggregateCall,
    ) -> QueryResult<Box<dyn ValueCursor>>;

    /// Upload module source under `file_name`, replacing any previous version.
    fn register_module(&self, file_name: &str, source: &str) -> QueryResult<()>;
}

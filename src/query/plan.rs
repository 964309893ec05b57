//! Query planning.
//!
//! Planning is pure: it reads the caller's statement, the qualifiers and an index
//! lookup, and produces an owned [`PlannedQuery`]. Every validation and compilation
//! error surfaces here, before the store is contacted.

use super::compile::{FilterProgram, compile_filter_program};
use crate::errors::{QueryError, QueryResult};
use crate::metadata::IndexDescriptor;
use crate::qualifier::{FieldQualifier, GenerationQualifier, KeyQualifier, KeyTarget, Qualifier};
use crate::store::{Key, Statement};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    PointLookup,
    NativeScan,
    NativeFilterPlusProgram,
    ProgramOnly,
}

impl PlanKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PointLookup => "point_lookup",
            Self::NativeScan => "native_scan",
            Self::NativeFilterPlusProgram => "native_filter_program",
            Self::ProgramOnly => "program_only",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Direct read of one record; `header_only` skips bin data.
    PointLookup { key: Key, header_only: bool, bin_names: Option<Vec<String>> },
    /// Native scan, with the statement's native filter if it has one.
    NativeScan { statement: Statement },
    /// Native filter narrows candidates, the program evaluates the rest.
    NativeFilterPlusProgram { statement: Statement, program: FilterProgram },
    /// Program evaluated over a full scan.
    ProgramOnly { statement: Statement, program: FilterProgram },
}

impl QueryPlan {
    #[must_use]
    pub const fn kind(&self) -> PlanKind {
        match self {
            Self::PointLookup { .. } => PlanKind::PointLookup,
            Self::NativeScan { .. } => PlanKind::NativeScan,
            Self::NativeFilterPlusProgram { .. } => PlanKind::NativeFilterPlusProgram,
            Self::ProgramOnly { .. } => PlanKind::ProgramOnly,
        }
    }

    #[must_use]
    pub const fn statement(&self) -> Option<&Statement> {
        match self {
            Self::PointLookup { .. } => None,
            Self::NativeScan { statement }
            | Self::NativeFilterPlusProgram { statement, .. }
            | Self::ProgramOnly { statement, .. } => Some(statement),
        }
    }

    #[must_use]
    pub const fn program(&self) -> Option<&FilterProgram> {
        match self {
            Self::NativeFilterPlusProgram { program, .. } | Self::ProgramOnly { program, .. } => {
                Some(program)
            }
            _ => None,
        }
    }
}

/// A plan plus the generation checks applied to whatever it returns.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuery {
    pub plan: QueryPlan,
    pub generation_checks: Vec<GenerationQualifier>,
}

/// Resolves a key qualifier against the statement's namespace and set.
///
/// # Errors
/// `InvalidArgument` when the user key has an unsupported type.
pub fn resolve_key(statement: &Statement, key: &KeyQualifier) -> QueryResult<Key> {
    match key.target() {
        KeyTarget::UserKey(v) => Key::new(&statement.namespace, statement.set.as_deref(), v.clone()),
        KeyTarget::Digest(d) => Ok(Key::from_digest(&statement.namespace, statement.set.as_deref(), *d)),
    }
}

fn index_serves(idx: &IndexDescriptor, statement: &Statement) -> bool {
    let ns_ok = idx.namespace.is_empty() || idx.namespace == statement.namespace;
    let set_ok = idx.set.is_none() || idx.set == statement.set;
    ns_ok && set_ok
}

/// Plans one query.
///
/// `index_lookup` answers "which index covers this bin", normally from the metadata
/// cache. With `meta_only` the plan fetches headers (key and generation) only.
///
/// # Errors
/// `InvalidQualifierCombination` for more than one key qualifier or a key mixed with
/// field qualifiers; `UnsupportedQualifier` when the remainder cannot be compiled;
/// `InvalidArgument` for an unusable key value.
pub fn plan_query<F>(
    statement: &Statement,
    meta_only: bool,
    qualifiers: &[Qualifier],
    index_lookup: F,
) -> QueryResult<PlannedQuery>
where
    F: Fn(&str) -> Option<IndexDescriptor>,
{
    let mut keys: Vec<&KeyQualifier> = Vec::new();
    let mut fields: Vec<&FieldQualifier> = Vec::new();
    let mut generation_checks = Vec::new();
    for q in qualifiers {
        match q {
            Qualifier::Key(k) => keys.push(k),
            Qualifier::Field(f) => fields.push(f),
            Qualifier::Generation(g) => generation_checks.push(*g),
        }
    }
    if keys.len() > 1 {
        return Err(QueryError::InvalidQualifierCombination(format!(
            "{} key qualifiers given, at most one is allowed",
            keys.len()
        )));
    }

    let mut stmt = statement.clone();
    if meta_only {
        stmt.include_bin_data = false;
    }

    if let Some(key) = keys.first() {
        if !fields.is_empty() {
            return Err(QueryError::InvalidQualifierCombination(
                "a key qualifier cannot be combined with field qualifiers".into(),
            ));
        }
        let key = resolve_key(&stmt, key)?;
        log::debug!("plan: point lookup on {key}");
        let plan = QueryPlan::PointLookup { key, header_only: meta_only, bin_names: stmt.bin_names };
        return Ok(PlannedQuery { plan, generation_checks });
    }

    if fields.is_empty() {
        log::debug!("plan: native scan of {}", stmt.namespace);
        return Ok(PlannedQuery { plan: QueryPlan::NativeScan { statement: stmt }, generation_checks });
    }

    // First indexable qualifier in array order wins; the store takes one native filter.
    let mut pushed = None;
    if stmt.filter.is_none() {
        for (i, q) in fields.iter().enumerate() {
            let Some(filter) = q.as_native_filter() else { continue };
            let Some(idx) = index_lookup(q.field()) else { continue };
            if idx.index_type.accepts(&filter) && index_serves(&idx, &stmt) {
                log::debug!("plan: pushing {} {} down to index {}", q.field(), q.operation(), idx.index_name);
                stmt.filter = Some(filter);
                pushed = Some(i);
                break;
            }
        }
    }

    let remainder = fields.iter().enumerate().filter(|(i, _)| Some(*i) != pushed).map(|(_, q)| *q);
    let plan = match (compile_filter_program(remainder)?, stmt.filter.is_some()) {
        (None, _) => QueryPlan::NativeScan { statement: stmt },
        (Some(program), true) => QueryPlan::NativeFilterPlusProgram { statement: stmt, program },
        (Some(program), false) => QueryPlan::ProgramOnly { statement: stmt, program },
    };
    log::debug!("plan: {}", plan.kind());
    Ok(PlannedQuery { plan, generation_checks })
}

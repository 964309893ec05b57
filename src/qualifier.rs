//! Predicate model.
//!
//! A [`Qualifier`] is a closed variant: a plain field predicate, a primary-key/digest
//! predicate, or a record-generation predicate. Qualifiers are immutable values and can be
//! reused across any number of queries.

use crate::errors::{QueryError, QueryResult};
use crate::store::{Digest, NativeFilter};
use bson::{Bson, Document as BsonDocument};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperation {
    Eq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    NotEq,
    Between,
    StartWith,
    EndsWith,
}

impl FilterOperation {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eq => "EQ",
            Self::Gt => "GT",
            Self::GtEq => "GTEQ",
            Self::Lt => "LT",
            Self::LtEq => "LTEQ",
            Self::NotEq => "NOTEQ",
            Self::Between => "BETWEEN",
            Self::StartWith => "START_WITH",
            Self::EndsWith => "ENDS_WITH",
        }
    }

    /// Operators the store can answer from a secondary index.
    #[must_use]
    pub const fn is_native(self) -> bool {
        matches!(self, Self::Eq | Self::Between)
    }
}

impl fmt::Display for FilterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Predicate on a single bin.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldQualifier {
    field: String,
    operation: FilterOperation,
    value1: Bson,
    value2: Option<Bson>,
}

impl FieldQualifier {
    /// # Errors
    /// `InvalidArgument` when `value2` is missing for BETWEEN or present for anything else.
    pub fn new(
        field: impl Into<String>,
        operation: FilterOperation,
        value1: impl Into<Bson>,
        value2: Option<Bson>,
    ) -> QueryResult<Self> {
        let field = field.into();
        if field.is_empty() {
            return Err(QueryError::InvalidArgument("qualifier field name is empty".into()));
        }
        match (operation, &value2) {
            (FilterOperation::Between, None) => {
                return Err(QueryError::InvalidArgument(format!(
                    "BETWEEN on '{field}' requires a second value"
                )));
            }
            (op, Some(_)) if op != FilterOperation::Between => {
                return Err(QueryError::InvalidArgument(format!(
                    "{op} on '{field}' takes a single value"
                )));
            }
            _ => {}
        }
        Ok(Self { field, operation, value1: value1.into(), value2 })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub const fn operation(&self) -> FilterOperation {
        self.operation
    }

    #[must_use]
    pub const fn value1(&self) -> &Bson {
        &self.value1
    }

    #[must_use]
    pub const fn value2(&self) -> Option<&Bson> {
        self.value2.as_ref()
    }

    /// Native equivalent of this predicate, defined only for EQ and BETWEEN over
    /// integer or string values.
    #[must_use]
    pub fn as_native_filter(&self) -> Option<NativeFilter> {
        match self.operation {
            FilterOperation::Eq => match &self.value1 {
                Bson::String(_) => {
                    Some(NativeFilter::Equal { bin: self.field.clone(), value: self.value1.clone() })
                }
                v => as_i64(v)
                    .map(|i| NativeFilter::Equal { bin: self.field.clone(), value: Bson::Int64(i) }),
            },
            FilterOperation::Between => {
                let begin = as_i64(&self.value1)?;
                let end = as_i64(self.value2.as_ref()?)?;
                Some(NativeFilter::Range { bin: self.field.clone(), begin, end })
            }
            _ => None,
        }
    }

    /// Evaluates the predicate against a set of bins on the client.
    ///
    /// Agrees with the compiled program: a missing bin satisfies only NOTEQ and an
    /// empty ENDS_WITH, and values of different type classes never compare.
    #[must_use]
    pub fn matches(&self, bins: &BsonDocument) -> bool {
        if self.operation == FilterOperation::EndsWith
            && matches!(&self.value1, Bson::String(p) if p.is_empty())
        {
            return true;
        }
        let Some(actual) = bins.get(&self.field) else {
            return self.operation == FilterOperation::NotEq;
        };
        match self.operation {
            FilterOperation::Eq => compare_values(actual, &self.value1) == Some(Ordering::Equal),
            FilterOperation::NotEq => {
                compare_values(actual, &self.value1) != Some(Ordering::Equal)
            }
            FilterOperation::Gt => compare_values(actual, &self.value1) == Some(Ordering::Greater),
            FilterOperation::GtEq => matches!(
                compare_values(actual, &self.value1),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperation::Lt => compare_values(actual, &self.value1) == Some(Ordering::Less),
            FilterOperation::LtEq => matches!(
                compare_values(actual, &self.value1),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperation::Between => {
                let Some(high) = &self.value2 else { return false };
                matches!(
                    compare_values(actual, &self.value1),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(compare_values(actual, high), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperation::StartWith => match (actual, &self.value1) {
                (Bson::String(s), Bson::String(p)) => s.starts_with(p.as_str()),
                _ => false,
            },
            FilterOperation::EndsWith => match (actual, &self.value1) {
                (Bson::String(s), Bson::String(p)) => s.ends_with(p.as_str()),
                _ => false,
            },
        }
    }
}

/// Which record a key qualifier addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyTarget {
    UserKey(Bson),
    Digest(Digest),
}

/// Primary-key or digest equality. Always EQ.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyQualifier {
    target: KeyTarget,
}

impl KeyQualifier {
    pub fn user_key(value: impl Into<Bson>) -> Self {
        Self { target: KeyTarget::UserKey(value.into()) }
    }

    #[must_use]
    pub const fn digest(digest: Digest) -> Self {
        Self { target: KeyTarget::Digest(digest) }
    }

    #[must_use]
    pub const fn target(&self) -> &KeyTarget {
        &self.target
    }
}

/// Comparison against a record's write generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationQualifier {
    operation: FilterOperation,
    generation: u32,
}

impl GenerationQualifier {
    /// # Errors
    /// `InvalidArgument` for operators other than EQ, GT, GTEQ, LT and LTEQ.
    pub fn new(operation: FilterOperation, generation: u32) -> QueryResult<Self> {
        match operation {
            FilterOperation::Eq
            | FilterOperation::Gt
            | FilterOperation::GtEq
            | FilterOperation::Lt
            | FilterOperation::LtEq => Ok(Self { operation, generation }),
            other => Err(QueryError::InvalidArgument(format!(
                "{other} is not an ordering comparison on generation"
            ))),
        }
    }

    #[must_use]
    pub const fn operation(&self) -> FilterOperation {
        self.operation
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub const fn matches(&self, generation: u32) -> bool {
        match self.operation {
            FilterOperation::Eq => generation == self.generation,
            FilterOperation::Gt => generation > self.generation,
            FilterOperation::GtEq => generation >= self.generation,
            FilterOperation::Lt => generation < self.generation,
            FilterOperation::LtEq => generation <= self.generation,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    Field(FieldQualifier),
    Key(KeyQualifier),
    Generation(GenerationQualifier),
}

impl Qualifier {
    /// # Errors
    /// See [`FieldQualifier::new`]; BETWEEN must go through [`Qualifier::between`].
    pub fn field(
        field: impl Into<String>,
        operation: FilterOperation,
        value: impl Into<Bson>,
    ) -> QueryResult<Self> {
        FieldQualifier::new(field, operation, value, None).map(Self::Field)
    }

    /// # Errors
    /// See [`FieldQualifier::new`].
    pub fn between(
        field: impl Into<String>,
        low: impl Into<Bson>,
        high: impl Into<Bson>,
    ) -> QueryResult<Self> {
        FieldQualifier::new(field, FilterOperation::Between, low, Some(high.into())).map(Self::Field)
    }

    /// Shorthand for an EQ field qualifier.
    ///
    /// # Errors
    /// `InvalidArgument` on an empty field name.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> QueryResult<Self> {
        Self::field(field, FilterOperation::Eq, value)
    }

    pub fn key(value: impl Into<Bson>) -> Self {
        Self::Key(KeyQualifier::user_key(value))
    }

    #[must_use]
    pub const fn digest(digest: Digest) -> Self {
        Self::Key(KeyQualifier::digest(digest))
    }

    /// # Errors
    /// See [`GenerationQualifier::new`].
    pub fn generation(operation: FilterOperation, generation: u32) -> QueryResult<Self> {
        GenerationQualifier::new(operation, generation).map(Self::Generation)
    }

    #[must_use]
    pub const fn as_key(&self) -> Option<&KeyQualifier> {
        match self {
            Self::Key(k) => Some(k),
            _ => None,
        }
    }
}

impl From<FieldQualifier> for Qualifier {
    fn from(q: FieldQualifier) -> Self {
        Self::Field(q)
    }
}

impl From<KeyQualifier> for Qualifier {
    fn from(q: KeyQualifier) -> Self {
        Self::Key(q)
    }
}

impl From<GenerationQualifier> for Qualifier {
    fn from(q: GenerationQualifier) -> Self {
        Self::Generation(q)
    }
}

pub(crate) fn as_i64(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Numeric values compare numerically, strings by byte order, booleans only for
/// equality. Anything else, including mixed types, is incomparable.
#[must_use]
pub fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Bson::Boolean(x), Bson::Boolean(y)) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

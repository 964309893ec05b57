//! Filter program compiler.
//!
//! Renders a conjunction of field qualifiers as the predicate text the store's
//! aggregation module evaluates per record:
//!
//! ```text
//! if color == 'blue' and age >= 25 and age <= 29 then selectedRec = true end
//! ```
//!
//! Compilation is pure and deterministic: the same qualifiers in the same order always
//! produce byte-identical text.

use crate::errors::{QueryError, QueryResult};
use crate::qualifier::{FieldQualifier, FilterOperation};
use bson::Bson;
use std::fmt;
use std::fmt::Write as _;

pub const SELECT_CLAUSE: &str = "selectedRec = true";

// Names that would collide with the scripting language or the module's own bindings.
const RESERVED: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while", "string",
    "selectedRec",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterProgram(String);

impl FilterProgram {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compiles the qualifiers into one program, or `None` when there is nothing left to
/// evaluate server-side.
///
/// # Errors
/// `UnsupportedQualifier` when a qualifier cannot be expressed.
pub fn compile_filter_program<'a, I>(qualifiers: I) -> QueryResult<Option<FilterProgram>>
where
    I: IntoIterator<Item = &'a FieldQualifier>,
{
    let mut terms = Vec::new();
    for q in qualifiers {
        terms.push(render_qualifier(q)?);
    }
    if terms.is_empty() {
        return Ok(None);
    }
    Ok(Some(FilterProgram(format!("if {} then {SELECT_CLAUSE} end", terms.join(" and ")))))
}

/// Renders one qualifier as a boolean expression.
///
/// # Errors
/// `UnsupportedQualifier` for non-identifier field names, non-scalar or non-finite
/// values, and type-class mismatches.
pub fn render_qualifier(q: &FieldQualifier) -> QueryResult<String> {
    check_field_name(q.field())?;
    check_types(q)?;
    let f = q.field();
    let v1 = render_value(q.value1())?;
    Ok(match q.operation() {
        FilterOperation::Eq => format!("{f} == {v1}"),
        FilterOperation::NotEq => format!("{f} ~= {v1}"),
        FilterOperation::Gt => format!("{f} > {v1}"),
        FilterOperation::GtEq => format!("{f} >= {v1}"),
        FilterOperation::Lt => format!("{f} < {v1}"),
        FilterOperation::LtEq => format!("{f} <= {v1}"),
        FilterOperation::Between => {
            let high = q.value2().ok_or_else(|| {
                QueryError::InvalidArgument(format!("BETWEEN on '{f}' requires a second value"))
            })?;
            let v2 = render_value(high)?;
            format!("{f} >= {v1} and {f} <= {v2}")
        }
        FilterOperation::StartWith => {
            format!("string.sub({f}, 1, string.len({v1})) == {v1}")
        }
        // An empty suffix matches every record, including ones without the bin.
        FilterOperation::EndsWith => {
            format!("({v1} == '' or string.sub({f}, -string.len({v1})) == {v1})")
        }
    })
}

fn check_field_name(field: &str) -> QueryResult<()> {
    let mut chars = field.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok {
        return Err(QueryError::UnsupportedQualifier(format!(
            "field '{field}' is not a plain identifier"
        )));
    }
    if RESERVED.contains(&field) {
        return Err(QueryError::UnsupportedQualifier(format!("field '{field}' is a reserved word")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueClass {
    Number,
    Text,
    Boolean,
}

fn value_class(v: &Bson) -> Option<ValueClass> {
    match v {
        Bson::Int32(_) | Bson::Int64(_) => Some(ValueClass::Number),
        Bson::Double(f) if f.is_finite() => Some(ValueClass::Number),
        Bson::String(_) => Some(ValueClass::Text),
        Bson::Boolean(_) => Some(ValueClass::Boolean),
        _ => None,
    }
}

fn check_types(q: &FieldQualifier) -> QueryResult<()> {
    let unsupported = |why: &str| {
        QueryError::UnsupportedQualifier(format!("{} on '{}': {why}", q.operation(), q.field()))
    };
    let class = value_class(q.value1())
        .ok_or_else(|| unsupported("value must be a finite number, string or boolean"))?;
    match q.operation() {
        FilterOperation::Eq | FilterOperation::NotEq => Ok(()),
        FilterOperation::StartWith | FilterOperation::EndsWith => {
            if class == ValueClass::Text { Ok(()) } else { Err(unsupported("value must be a string")) }
        }
        FilterOperation::Gt | FilterOperation::GtEq | FilterOperation::Lt | FilterOperation::LtEq => {
            if class == ValueClass::Boolean {
                Err(unsupported("booleans have no ordering"))
            } else {
                Ok(())
            }
        }
        FilterOperation::Between => {
            let high = q.value2().ok_or_else(|| unsupported("missing upper bound"))?;
            let high_class = value_class(high)
                .ok_or_else(|| unsupported("upper bound must be a finite number or string"))?;
            if class == ValueClass::Boolean || class != high_class {
                Err(unsupported("bounds must both be numbers or both be strings"))
            } else {
                Ok(())
            }
        }
    }
}

fn render_value(v: &Bson) -> QueryResult<String> {
    match v {
        Bson::Int32(i) => Ok(i.to_string()),
        Bson::Int64(i) => Ok(i.to_string()),
        Bson::Double(f) if f.is_finite() => Ok(format!("{f:?}")),
        Bson::Boolean(b) => Ok(b.to_string()),
        Bson::String(s) => Ok(quote(s)),
        other => Err(QueryError::UnsupportedQualifier(format!("cannot render value {other:?}"))),
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\{:03}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

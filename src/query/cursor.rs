use crate::errors::{QueryError, QueryResult};
use crate::qualifier::GenerationQualifier;
use crate::store::{Digest, Key, KeyRecord, Record, RecordCursor, ValueCursor};
use bson::{Bson, Document as BsonDocument};

enum Source {
    Single(Option<KeyRecord>),
    Native(Box<dyn RecordCursor>),
    Aggregated { cursor: Box<dyn ValueCursor>, namespace: String, set: Option<String> },
}

/// Lazy, single-pass, closable sequence over query results.
///
/// Whatever path a plan took (point lookup, native cursor, aggregated cursor), callers
/// see one type. `close` releases the underlying cursor and may be called at any point
/// and any number of times; dropping the iterator closes it.
pub struct ResultIterator {
    source: Source,
    generation_checks: Vec<GenerationQualifier>,
    peeked: Option<KeyRecord>,
    closed: bool,
}

impl std::fmt::Debug for ResultIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Single(_) => "single",
            Source::Native(_) => "native",
            Source::Aggregated { .. } => "aggregated",
        };
        f.debug_struct("ResultIterator").field("source", &kind).field("closed", &self.closed).finish()
    }
}

impl ResultIterator {
    pub(crate) fn single(record: Option<KeyRecord>, checks: Vec<GenerationQualifier>) -> Self {
        Self::with_source(Source::Single(record), checks)
    }

    pub(crate) fn native(cursor: Box<dyn RecordCursor>, checks: Vec<GenerationQualifier>) -> Self {
        Self::with_source(Source::Native(cursor), checks)
    }

    pub(crate) fn aggregated(
        cursor: Box<dyn ValueCursor>,
        namespace: &str,
        set: Option<&str>,
        checks: Vec<GenerationQualifier>,
    ) -> Self {
        Self::with_source(
            Source::Aggregated {
                cursor,
                namespace: namespace.to_string(),
                set: set.map(str::to_string),
            },
            checks,
        )
    }

    fn with_source(source: Source, generation_checks: Vec<GenerationQualifier>) -> Self {
        Self { source, generation_checks, peeked: None, closed: false }
    }

    /// # Errors
    /// Propagates store failures and malformed aggregation output.
    pub fn has_next(&mut self) -> QueryResult<bool> {
        if self.peeked.is_none() {
            self.peeked = self.pull()?;
        }
        Ok(self.peeked.is_some())
    }

    /// # Errors
    /// Propagates store failures and malformed aggregation output.
    pub fn next_record(&mut self) -> QueryResult<Option<KeyRecord>> {
        if let Some(r) = self.peeked.take() {
            return Ok(Some(r));
        }
        self.pull()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.peeked = None;
        match &mut self.source {
            Source::Single(r) => *r = None,
            Source::Native(c) => c.close(),
            Source::Aggregated { cursor, .. } => cursor.close(),
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    fn pull(&mut self) -> QueryResult<Option<KeyRecord>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            let next = match &mut self.source {
                Source::Single(r) => r.take(),
                Source::Native(c) => c.next_record()?,
                Source::Aggregated { cursor, namespace, set } => match cursor.next_value()? {
                    Some(v) => Some(key_record_from_output(namespace, set.as_deref(), v)?),
                    None => None,
                },
            };
            let Some(rec) = next else {
                self.close();
                return Ok(None);
            };
            if self.generation_checks.iter().all(|g| g.matches(rec.record.generation)) {
                return Ok(Some(rec));
            }
        }
    }
}

impl Iterator for ResultIterator {
    type Item = QueryResult<KeyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => None,
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for ResultIterator {
    fn drop(&mut self) {
        self.close();
    }
}

fn malformed(what: &str) -> QueryError {
    QueryError::Store(format!("malformed filter module output: {what}"))
}

fn as_u32(doc: &BsonDocument, field: &str) -> QueryResult<u32> {
    let n = match doc.get(field) {
        Some(Bson::Int32(i)) => i64::from(*i),
        Some(Bson::Int64(i)) => *i,
        None => 0,
        Some(_) => return Err(malformed(field)),
    };
    u32::try_from(n).map_err(|_| malformed(field))
}

/// Converts one value emitted by the filter module back into a record.
fn key_record_from_output(namespace: &str, set: Option<&str>, value: Bson) -> QueryResult<KeyRecord> {
    let Bson::Document(mut doc) = value else {
        return Err(malformed("expected a document"));
    };
    let digest = match doc.get("digest") {
        Some(Bson::Binary(b)) => Digest::from_slice(&b.bytes).ok_or_else(|| malformed("digest length"))?,
        _ => return Err(malformed("missing digest")),
    };
    let generation = as_u32(&doc, "generation")?;
    let expiration = as_u32(&doc, "expiration")?;
    let bins = match doc.remove("bins") {
        Some(Bson::Document(d)) => d,
        None => BsonDocument::new(),
        Some(_) => return Err(malformed("bins")),
    };
    let mut key = Key::from_digest(namespace, set, digest);
    key.user_key = doc.remove("key");
    Ok(KeyRecord { key, record: Record { bins, generation, expiration } })
}

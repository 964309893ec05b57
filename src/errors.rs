use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid qualifier combination: {0}")]
    InvalidQualifierCombination(String),

    #[error("unsupported qualifier: {0}")]
    UnsupportedQualifier(String),

    #[error("generation conflict on record {0}")]
    GenerationConflict(String),

    #[error("record already exists: {0}")]
    RecordExists(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("feature not implemented: {0}")]
    FeatureNotImplemented(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl QueryError {
    /// Errors that stop a whole call rather than a single record of a batch.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<std::io::Error> for QueryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

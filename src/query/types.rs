use serde::{Deserialize, Serialize};

/// Outcome of a batch update or delete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    /// Records matched.
    pub read: u64,
    /// Records successfully mutated; never exceeds `read`.
    pub write: u64,
}

impl MutationReport {
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.read.saturating_sub(self.write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutationKind {
    Update,
    Delete,
}

impl MutationKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

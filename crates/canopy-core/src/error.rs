//! Error taxonomy for the engine.
//!
//! Collaborators (vectorizers, synthesizers, oracles) report failures as
//! `anyhow::Error`; the engine wraps them into the typed variants below
//! with enough context (node id, level, attempt count) to diagnose.

use thiserror::Error;

use crate::models::NodeId;

/// Boxed source error carried by wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for `canopy-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store, the builder and the refinement path.
#[derive(Debug, Error)]
pub enum Error {
    /// No node with this identifier exists in the store.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// No segment with this sequence index exists in the store.
    #[error("segment not found: {0}")]
    SegmentNotFound(u64),

    /// Illegal lineage mutation (child list, level, edit log, second parent).
    #[error("conflict on {id}: {reason}")]
    Conflict { id: String, reason: String },

    /// The external synthesizer failed.
    #[error("synthesis failed ({context}): {source}")]
    Synthesis {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The external vectorizer failed or returned a malformed batch.
    #[error("vectorization failed ({context}): {source}")]
    Vectorize {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The grouping oracle returned an error (not a degenerate partition).
    #[error("grouping failed at level {level}: {source}")]
    Grouping {
        level: u32,
        #[source]
        source: BoxError,
    },

    /// Storage failure that persisted through every transparent retry.
    #[error("store I/O failed after {attempts} attempt(s): {source}")]
    StoreIo {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// A build could not reach a single root. Nothing was committed.
    #[error("build failed at level {level}{} after {attempts} attempt(s): {source}", group_suffix(.group))]
    Construction {
        level: u32,
        group: Option<usize>,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Caller supplied unusable input (empty document, blank instruction, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn group_suffix(group: &Option<usize>) -> String {
    match group {
        Some(g) => format!(", group {}", g),
        None => String::new(),
    }
}

/// Flat classification of [`Error`] for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Synthesis,
    Vectorize,
    Grouping,
    StoreIo,
    Construction,
    InvalidInput,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NodeNotFound(_) | Error::SegmentNotFound(_) => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Synthesis { .. } => ErrorKind::Synthesis,
            Error::Vectorize { .. } => ErrorKind::Vectorize,
            Error::Grouping { .. } => ErrorKind::Grouping,
            Error::StoreIo { .. } => ErrorKind::StoreIo,
            Error::Construction { .. } => ErrorKind::Construction,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn conflict(id: impl ToString, reason: impl Into<String>) -> Self {
        Error::Conflict {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn synthesis(context: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Synthesis {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn vectorize(context: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Vectorize {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Innermost error of a [`Error::Construction`] chain (or `self`).
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Construction { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_message_names_level_and_group() {
        let err = Error::Construction {
            level: 2,
            group: Some(3),
            attempts: 4,
            source: Box::new(Error::synthesis("node at level 2", anyhow::anyhow!("rate limited"))),
        };
        let msg = err.to_string();
        assert!(msg.contains("level 2, group 3"), "{}", msg);
        assert!(msg.contains("4 attempt(s)"), "{}", msg);
        assert_eq!(err.root_cause().kind(), ErrorKind::Synthesis);
    }

    #[test]
    fn not_found_kinds() {
        assert!(Error::SegmentNotFound(7).is_not_found());
        assert!(Error::NodeNotFound(NodeId::from("x")).is_not_found());
        assert!(!Error::InvalidInput("x".into()).is_not_found());
    }
}

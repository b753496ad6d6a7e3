//! Deferred-operation vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An operation a client (or the recovery scan) asks the gateway to carry
/// out eventually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeferredOp {
    Write,
    Archive,
    Restore,
    Delete,
}

impl fmt::Display for DeferredOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredOp::Write => write!(f, "WRITE"),
            DeferredOp::Archive => write!(f, "ARCHIVE"),
            DeferredOp::Restore => write!(f, "RESTORE"),
            DeferredOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// The transition currently requested for an entity.
///
/// Absence of an entry in the queue means no transition is pending and the
/// entity is taken to be wherever it currently lives (online or archived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestedState {
    ArchiveRequested,
    DeleteRequested,
    RestoreRequested,
    WriteRequested,
    WriteThenArchiveRequested,
}

impl fmt::Display for RequestedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedState::ArchiveRequested => write!(f, "ARCHIVE_REQUESTED"),
            RequestedState::DeleteRequested => write!(f, "DELETE_REQUESTED"),
            RequestedState::RestoreRequested => write!(f, "RESTORE_REQUESTED"),
            RequestedState::WriteRequested => write!(f, "WRITE_REQUESTED"),
            RequestedState::WriteThenArchiveRequested => {
                write!(f, "WRITE_THEN_ARCHIVE_REQUESTED")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_state_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&RequestedState::WriteThenArchiveRequested).unwrap();
        assert_eq!(json, "\"WRITE_THEN_ARCHIVE_REQUESTED\"");
        assert_eq!(
            RequestedState::WriteThenArchiveRequested.to_string(),
            "WRITE_THEN_ARCHIVE_REQUESTED"
        );
    }

    #[test]
    fn deferred_op_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&DeferredOp::Restore).unwrap(), "\"RESTORE\"");
    }
}

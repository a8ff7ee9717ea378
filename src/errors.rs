//! Typed error hierarchy for the Conductor orchestration engine.
//!
//! One top-level enum covers the orchestration core. Retryability follows the
//! taxonomy: CAS conflicts are retryable after a re-read, validation and
//! budget failures are not, storage/queue failures carry the underlying cause.

use thiserror::Error;

/// Errors from the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad spec or input. Not retryable.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Optimistic-concurrency mismatch: the stored status did not match the
    /// expected one and zero rows changed. Callers re-read and retry or abandon.
    #[error("{entity} {id} status conflict (expected {expected})")]
    Conflict {
        entity: &'static str,
        id: i64,
        expected: String,
    },

    /// A lifecycle transition was requested from an illegal source status.
    #[error("Protocol {id} cannot move from {from} to {to}")]
    InvalidStateTransition { id: i64, from: String, to: String },

    /// Cumulative or per-call token budget exceeded under strict mode.
    #[error("{scope} token budget exceeded: {projected} > {limit}")]
    BudgetExceeded {
        scope: &'static str,
        projected: u64,
        limit: u64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// No step is in a runnable (pending/blocked/failed) state.
    #[error("No runnable step in protocol {protocol_run_id}")]
    NoRunnableStep { protocol_run_id: i64 },

    /// Durable queue infrastructure failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Malformed JSON in a persisted column.
    #[error("Corrupt {column} JSON for {entity} {id}: {source}")]
    CorruptColumn {
        entity: &'static str,
        id: i64,
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Queue(_) | Self::Storage(_) | Self::Other(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_carries_entity_and_id() {
        let err = OrchestratorError::Conflict {
            entity: "StepRun",
            id: 7,
            expected: "running".into(),
        };
        match &err {
            OrchestratorError::Conflict { entity, id, .. } => {
                assert_eq!(*entity, "StepRun");
                assert_eq!(*id, 7);
            }
            _ => panic!("Expected Conflict variant"),
        }
        assert!(err.to_string().contains("StepRun 7"));
    }

    #[test]
    fn conflict_is_retryable_but_validation_is_not() {
        let conflict = OrchestratorError::Conflict {
            entity: "ProtocolRun",
            id: 1,
            expected: "pending".into(),
        };
        assert!(conflict.is_retryable());

        let validation = OrchestratorError::Validation("prompt_ref missing".into());
        assert!(!validation.is_retryable());

        let budget = OrchestratorError::BudgetExceeded {
            scope: "protocol",
            projected: 12_000,
            limit: 10_000,
        };
        assert!(!budget.is_retryable());
    }

    #[test]
    fn budget_exceeded_message_shows_both_numbers() {
        let err = OrchestratorError::BudgetExceeded {
            scope: "step",
            projected: 5100,
            limit: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("5100"));
        assert!(msg.contains("5000"));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = OrchestratorError::InvalidStateTransition {
            id: 3,
            from: "running".into(),
            to: "planning".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("running"));
        assert!(msg.contains("planning"));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::NoRunnableStep { protocol_run_id: 1 });
        assert_std_error(&OrchestratorError::Queue("redis down".into()));
    }
}

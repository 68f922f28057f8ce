use crate::model::Collection;

/// Failures reported by a [`crate::StoreAdapter`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: String },
    /// A stored row could not be decoded into a domain record.
    #[error("malformed {collection} record {id}: {reason}")]
    Malformed { collection: Collection, id: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: String },
    #[error("store unavailable after {repaired} repaired record(s): {message}")]
    StoreUnavailable { repaired: usize, message: String },
    #[error(
        "unresolved title mismatch on {collection} record {id}: \
         no correction for {actual:?} and quarantine is disabled"
    )]
    UnresolvedMismatch { collection: Collection, id: String, actual: String },
    #[error("malformed {collection} record {id} in store: {reason}")]
    MalformedRecord { collection: Collection, id: String, reason: String },
}

impl ReconError {
    /// Lift a store failure into a run-level error, keeping the number of
    /// records already written before the failure.
    #[must_use]
    pub fn from_store(err: StoreError, repaired: usize) -> Self {
        match err {
            StoreError::NotFound { collection, id } => Self::NotFound { collection, id },
            StoreError::Malformed { collection, id, reason } => {
                Self::MalformedRecord { collection, id, reason }
            }
            StoreError::Unavailable(message) => Self::StoreUnavailable { repaired, message },
        }
    }

    /// Per-record errors are logged and skipped; everything else ends the run.
    #[must_use]
    pub fn is_per_record(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::UnresolvedMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_rows_are_not_reported_as_outages() {
        let err = ReconError::from_store(
            StoreError::Malformed {
                collection: Collection::Requests,
                id: "legacy-7".to_string(),
                reason: "invalid needed_from date: 14/03/2026".to_string(),
            },
            0,
        );
        assert!(!err.is_per_record());
        let message = err.to_string();
        assert!(message.starts_with("malformed requests record legacy-7"), "message was {message}");
        assert!(!message.contains("unavailable"));
    }

    #[test]
    fn unavailable_store_keeps_repaired_count() {
        let err = ReconError::from_store(StoreError::Unavailable("disk I/O error".to_string()), 3);
        assert_eq!(
            err,
            ReconError::StoreUnavailable { repaired: 3, message: "disk I/O error".to_string() }
        );
    }
}

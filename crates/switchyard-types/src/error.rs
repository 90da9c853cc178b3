use thiserror::Error;

/// Errors from repository operations (used by trait definitions in switchyard-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backend rejected or failed a statement, or returned a row that
    /// does not decode.
    #[error("query error: {0}")]
    Query(String),

    /// Optimistic concurrency check failed: the stored version moved on.
    #[error("version conflict for session '{session_id}': expected {expected}, found {actual}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_version_conflict_display() {
        let err = RepositoryError::VersionConflict {
            session_id: "s-1".to_string(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("s-1"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 4"));
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while talking to the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("transient cluster error ({status}): {message}")]
    Transient { status: u16, message: String },

    #[error("cluster request failed ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("unable to decode cluster response: {0}")]
    Decode(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Maps an HTTP status code to the error class used by the gatherers.
    pub fn from_status(status: u16, what: &str, message: String) -> Self {
        match status {
            404 => ClusterError::NotFound(what.to_string()),
            429 | 500..=599 => ClusterError::Transient { status, message },
            _ => ClusterError::Permanent { status, message },
        }
    }
}

/// Errors that can occur while gathering, anonymizing and recording data
#[derive(Debug, thiserror::Error)]
pub enum GatherError {
    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("unable to marshal record: {0}")]
    Marshal(String),

    #[error("anonymization failed: {0}")]
    Anonymization(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("context cancelled")]
    ContextCancelled,

    #[error("unknown gathering function: {0}")]
    UnknownTask(String),

    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("panic: {0}")]
    Panic(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{0}")]
    Warning(String),

    #[error("{0}")]
    Aggregated(String),
}

impl GatherError {
    pub fn is_warning(&self) -> bool {
        matches!(self, GatherError::Warning(_))
    }
}

impl From<serde_json::Error> for GatherError {
    fn from(err: serde_json::Error) -> Self {
        GatherError::Marshal(err.to_string())
    }
}

/// Order preserving removal of duplicate messages.
pub fn unique_messages<I, S>(messages: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for message in messages {
        let message = message.into();
        if seen.insert(message.clone()) {
            unique.push(message);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = GatherError::FieldNotFound("spec.storage.s3.bucket".to_string());
        assert_eq!(error.to_string(), "field not found: spec.storage.s3.bucket");

        let error = GatherError::UnknownTask("nope".to_string());
        assert_eq!(error.to_string(), "unknown gathering function: nope");
    }

    #[test]
    fn test_cluster_error_from_status() {
        assert!(ClusterError::from_status(404, "pods", String::new()).is_not_found());
        assert!(matches!(
            ClusterError::from_status(503, "pods", "unavailable".into()),
            ClusterError::Transient { status: 503, .. }
        ));
        assert!(matches!(
            ClusterError::from_status(429, "pods", "slow down".into()),
            ClusterError::Transient { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(403, "pods", "forbidden".into()),
            ClusterError::Permanent { status: 403, .. }
        ));
    }

    #[test]
    fn test_cluster_error_is_transparent() {
        let error: GatherError = ClusterError::NotFound("nodes".into()).into();
        assert_eq!(error.to_string(), "nodes not found");
    }

    #[test]
    fn test_unique_messages_keeps_first_occurrence_order() {
        let unique = unique_messages(["b", "a", "b", "c", "a"]);
        assert_eq!(unique, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_warning_is_not_error() {
        assert!(GatherError::Warning("skipped".into()).is_warning());
        assert!(!GatherError::ContextCancelled.is_warning());
    }
}

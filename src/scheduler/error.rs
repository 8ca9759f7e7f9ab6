//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// No worker registered for the job's target type
    UnknownTarget {
        target_type: String,
        known: Vec<String>,
    },

    /// Target type is known but does not expose the operation
    UnknownOperation {
        target_type: String,
        operation: String,
    },

    /// A job with the same name is already queued or running
    DuplicateJob {
        name: String,
    },

    /// Session file could not be written or read
    Persistence {
        operation: String,
        reason: String,
    },

    /// Scheduler configuration rejected
    InvalidConfig {
        field: String,
        reason: String,
    },

    /// Scheduler loop is gone
    ChannelClosed,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTarget { target_type, known } => {
                if known.is_empty() {
                    write!(f, "Unknown target type '{}'. No workers registered", target_type)
                } else {
                    write!(
                        f,
                        "Unknown target type '{}'. Registered: {}",
                        target_type,
                        known.join(", ")
                    )
                }
            }
            Self::UnknownOperation {
                target_type,
                operation,
            } => {
                write!(f, "Target '{}' has no operation '{}'", target_type, operation)
            }
            Self::DuplicateJob { name } => {
                write!(f, "Job '{}' is already queued or running", name)
            }
            Self::Persistence { operation, reason } => {
                write!(f, "Persistence error during '{}': {}", operation, reason)
            }
            Self::InvalidConfig { field, reason } => {
                write!(f, "Invalid scheduler config '{}': {}", field, reason)
            }
            Self::ChannelClosed => write!(f, "Scheduler loop has stopped"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create an unknown target error
    pub fn unknown_target(target_type: impl Into<String>, known: Vec<String>) -> Self {
        Self::UnknownTarget {
            target_type: target_type.into(),
            known,
        }
    }

    /// Create an unknown operation error
    pub fn unknown_operation(target_type: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnknownOperation {
            target_type: target_type.into(),
            operation: operation.into(),
        }
    }

    pub fn duplicate_job(name: impl Into<String>) -> Self {
        Self::DuplicateJob { name: name.into() }
    }

    /// Create a persistence error, keeping the whole cause chain in `reason`
    pub fn persistence(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Persistence {
            operation: operation.into(),
            reason: format!("{err:#}"),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Persistence { .. } | Self::DuplicateJob { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_target_error() {
        let err = SchedulerError::unknown_target("siteZ", vec!["siteA".to_string()]);
        assert!(err.to_string().contains("siteZ"));
        assert!(err.to_string().contains("siteA"));

        let empty = SchedulerError::unknown_target("siteZ", Vec::new());
        assert!(empty.to_string().contains("No workers"));
    }

    #[test]
    fn test_unknown_operation_error() {
        let err = SchedulerError::unknown_operation("siteA", "withdraw");
        assert!(err.to_string().contains("withdraw"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_persistence_keeps_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("Failed to write temp session file");
        let err = SchedulerError::persistence("save session", &cause);
        let text = err.to_string();
        assert!(text.contains("save session"));
        assert!(text.contains("Failed to write temp session file"));
        assert!(text.contains("disk full"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(SchedulerError::duplicate_job("faucet").is_recoverable());
        assert!(!SchedulerError::ChannelClosed.is_recoverable());
        assert!(!SchedulerError::invalid_config("max_concurrent", "zero").is_recoverable());
    }
}

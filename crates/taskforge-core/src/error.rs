// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskforge-core.
//!
//! Every failure that terminates a task maps to a stable reason string
//! which is surfaced through the task's audit event and the live-update
//! payload, so external consumers can branch on it without parsing
//! human-readable messages.

use std::fmt;

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while admitting or running a task.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Invalid JSON in environment, arguments or params.
    Config {
        /// What was being parsed (e.g. "environment", "template arguments").
        what: String,
        /// Parser error details.
        details: String,
    },

    /// A referenced template/inventory/repository/environment row does not exist.
    MissingDependency {
        /// The kind of row that was not found.
        kind: &'static str,
        /// The id that was looked up.
        id: i64,
    },

    /// SSH key installation or vault password load failed.
    Secret {
        /// The reason for failure.
        reason: String,
    },

    /// Clone, checkout or remote-head lookup failed.
    Repo {
        /// The reason for failure.
        reason: String,
    },

    /// Galaxy install, terraform init or workspace selection failed.
    Requirements {
        /// The reason for failure.
        reason: String,
    },

    /// The child process exited non-zero.
    Run {
        /// Exit code, if the process exited at all.
        code: Option<i32>,
    },

    /// The user denied a plan confirmation.
    Rejected,

    /// The owning node died while the task was in flight.
    Orphaned,

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Unexpected failure, including converted panics.
    Internal {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Stable reason string for this error, surfaced via task events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::Secret { .. } => "secret_error",
            Self::Repo { .. } => "repo_error",
            Self::Requirements { .. } => "requirements_error",
            Self::Run { .. } => "run_error",
            Self::Rejected => "rejected",
            Self::Orphaned => "orphaned",
            Self::Database { .. } | Self::Internal { .. } => "internal",
        }
    }

    /// Shorthand for a database error from a named operation.
    pub fn db(operation: &str, err: impl fmt::Display) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { what, details } => {
                write!(f, "invalid {} JSON: {}", what, details)
            }
            Self::MissingDependency { kind, id } => {
                write!(f, "{} {} not found", kind, id)
            }
            Self::Secret { reason } => write!(f, "secret installation failed: {}", reason),
            Self::Repo { reason } => write!(f, "repository operation failed: {}", reason),
            Self::Requirements { reason } => {
                write!(f, "requirements installation failed: {}", reason)
            }
            Self::Run { code } => match code {
                Some(code) => write!(f, "process exited with code {}", code),
                None => write!(f, "process terminated by signal"),
            },
            Self::Rejected => write!(f, "apply rejected by user"),
            Self::Orphaned => write!(f, "owning node died"),
            Self::Database { operation, details } => {
                write!(f, "database error during '{}': {}", operation, details)
            }
            Self::Internal { details } => write!(f, "internal error: {}", details),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Config {
            what: "payload".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        let cases: Vec<(CoreError, &str)> = vec![
            (
                CoreError::Config {
                    what: "environment".into(),
                    details: "expected value".into(),
                },
                "config_error",
            ),
            (
                CoreError::MissingDependency {
                    kind: "template",
                    id: 7,
                },
                "missing_dependency",
            ),
            (
                CoreError::Secret {
                    reason: "no key".into(),
                },
                "secret_error",
            ),
            (
                CoreError::Repo {
                    reason: "clone failed".into(),
                },
                "repo_error",
            ),
            (
                CoreError::Requirements {
                    reason: "init failed".into(),
                },
                "requirements_error",
            ),
            (CoreError::Run { code: Some(2) }, "run_error"),
            (CoreError::Rejected, "rejected"),
            (CoreError::Orphaned, "orphaned"),
            (CoreError::db("insert", "connection refused"), "internal"),
            (
                CoreError::Internal {
                    details: "panicked".into(),
                },
                "internal",
            ),
        ];

        for (err, reason) in cases {
            assert_eq!(err.reason(), reason, "wrong reason for {:?}", err);
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_display_missing_dependency() {
        let err = CoreError::MissingDependency {
            kind: "inventory",
            id: 3,
        };
        assert_eq!(err.to_string(), "inventory 3 not found");
    }

    #[test]
    fn test_run_error_display() {
        assert_eq!(
            CoreError::Run { code: Some(1) }.to_string(),
            "process exited with code 1"
        );
        assert_eq!(
            CoreError::Run { code: None }.to_string(),
            "process terminated by signal"
        );
    }
}

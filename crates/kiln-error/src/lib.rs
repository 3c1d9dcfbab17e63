//! Typed error types for the kiln code-execution broker.
//!
//! Provides [`BridgeError`], the canonical error type shared by the
//! discovery, client, sandbox, and broker layers, and [`RunStatus`], the
//! four-value status surface reported to callers of `run_python`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status surfaced to callers for one execution.
///
/// The only non-numeric failure shape callers ever see; everything else is
/// a human-readable message alongside one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Execution completed; stdout/stderr captured.
    Success,
    /// The broker or sandbox failed.
    Error,
    /// The request was rejected before the container was touched.
    ValidationError,
    /// Execution exceeded its time budget; partial output preserved.
    Timeout,
}

impl RunStatus {
    /// The wire spelling (`snake_case`, matching the serialized form).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::ValidationError => "validation_error",
            Self::Timeout => "timeout",
        }
    }
}

/// Canonical error type for broker operations.
///
/// Variants map 1:1 onto the failure kinds a caller can observe. All
/// variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The request failed validation before any work was done.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A requested server name is not known to the broker.
    #[error("unknown server '{name}'")]
    UnknownServer {
        /// The name the caller asked for.
        name: String,
        /// Every server name the broker does know.
        known: Vec<String>,
    },

    /// No container runtime could be located.
    #[error("no container runtime found (probed: {})", probed.join(", "))]
    RuntimeUnavailable {
        /// The executables that were probed, in order.
        probed: Vec<String>,
    },

    /// The container runtime was found but the sandbox failed to come up.
    #[error("container launch failed: {details}")]
    ContainerLaunchFailed {
        /// Runtime exit diagnostics (stderr excerpt, exit status).
        details: String,
    },

    /// A tool server's child process failed to start or handshake.
    #[error("server '{server}' failed to start: {message}")]
    ServerStartFailed {
        /// The configured server name.
        server: String,
        /// What went wrong (spawn error, handshake timeout, ...).
        message: String,
    },

    /// A tool server died or its transport broke mid-session.
    #[error("server '{server}' is unavailable: {message}")]
    ServerUnavailable {
        /// The configured server name.
        server: String,
        /// Transport-level detail.
        message: String,
    },

    /// A tool server accepted the call and reported an error.
    #[error("tool call failed on '{server}': {message}")]
    Tool {
        /// The server that rejected the call.
        server: String,
        /// The server's error message, preserved verbatim.
        message: String,
    },

    /// Execution exceeded the per-run time budget.
    #[error("execution timed out after {seconds}s")]
    Timeout {
        /// The budget that was exceeded.
        seconds: u64,
        /// Output captured before the deadline.
        stdout: String,
        /// Diagnostics captured before the deadline.
        stderr: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::UnknownServer { .. } => "UNKNOWN_SERVER",
            Self::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
            Self::ContainerLaunchFailed { .. } => "CONTAINER_LAUNCH_FAILED",
            Self::ServerStartFailed { .. } => "SERVER_START_FAILED",
            Self::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            Self::Tool { .. } => "TOOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The caller-facing status this error maps to.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Validation(_) | Self::UnknownServer { .. } => RunStatus::ValidationError,
            Self::Timeout { .. } => RunStatus::Timeout,
            _ => RunStatus::Error,
        }
    }

    /// Returns whether the operation that produced this error may succeed
    /// if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ServerUnavailable { .. } => true,
            Self::ContainerLaunchFailed { .. } => true,
            Self::Validation(_)
            | Self::UnknownServer { .. }
            | Self::RuntimeUnavailable { .. }
            | Self::ServerStartFailed { .. }
            | Self::Tool { .. }
            | Self::Internal(_) => false,
        }
    }

    /// For [`BridgeError::UnknownServer`], a "did you mean" hint when a
    /// known name is within edit distance 3. `None` for other variants.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownServer { name, known } => find_similar_server(name, known),
            _ => None,
        }
    }
}

/// Find the closest matching server name using Levenshtein distance.
fn find_similar_server(name: &str, known: &[String]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in known {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, candidate)| format!("did you mean '{candidate}'?"))
}

// Compile-time assertion: BridgeError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BridgeError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_validation() {
        let err = BridgeError::Validation("empty code".into());
        assert_eq!(err.to_string(), "invalid request: empty code");
    }

    #[test]
    fn display_unknown_server() {
        let err = BridgeError::UnknownServer {
            name: "weathr".into(),
            known: vec!["weather".into()],
        };
        assert_eq!(err.to_string(), "unknown server 'weathr'");
    }

    #[test]
    fn display_runtime_unavailable_lists_probes() {
        let err = BridgeError::RuntimeUnavailable {
            probed: vec!["podman".into(), "docker".into()],
        };
        assert_eq!(
            err.to_string(),
            "no container runtime found (probed: podman, docker)"
        );
    }

    #[test]
    fn display_tool_preserves_message() {
        let err = BridgeError::Tool {
            server: "weather".into(),
            message: "city not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "tool call failed on 'weather': city not found"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            BridgeError::Validation("x".into()).status(),
            RunStatus::ValidationError
        );
        assert_eq!(
            BridgeError::UnknownServer {
                name: "x".into(),
                known: vec![]
            }
            .status(),
            RunStatus::ValidationError
        );
        assert_eq!(
            BridgeError::Timeout {
                seconds: 5,
                stdout: String::new(),
                stderr: String::new()
            }
            .status(),
            RunStatus::Timeout
        );
        assert_eq!(
            BridgeError::ContainerLaunchFailed {
                details: "x".into()
            }
            .status(),
            RunStatus::Error
        );
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(BridgeError, &str)> = vec![
            (BridgeError::Validation("x".into()), "VALIDATION"),
            (
                BridgeError::UnknownServer {
                    name: "x".into(),
                    known: vec![],
                },
                "UNKNOWN_SERVER",
            ),
            (
                BridgeError::RuntimeUnavailable { probed: vec![] },
                "RUNTIME_UNAVAILABLE",
            ),
            (
                BridgeError::ContainerLaunchFailed {
                    details: "x".into(),
                },
                "CONTAINER_LAUNCH_FAILED",
            ),
            (
                BridgeError::ServerStartFailed {
                    server: "s".into(),
                    message: "m".into(),
                },
                "SERVER_START_FAILED",
            ),
            (
                BridgeError::ServerUnavailable {
                    server: "s".into(),
                    message: "m".into(),
                },
                "SERVER_UNAVAILABLE",
            ),
            (
                BridgeError::Tool {
                    server: "s".into(),
                    message: "m".into(),
                },
                "TOOL_ERROR",
            ),
            (
                BridgeError::Timeout {
                    seconds: 1,
                    stdout: String::new(),
                    stderr: String::new(),
                },
                "TIMEOUT",
            ),
            (BridgeError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.code(), *expected, "wrong code for {err}");
        }
    }

    #[test]
    fn retryable_cases() {
        assert!(BridgeError::Timeout {
            seconds: 1,
            stdout: String::new(),
            stderr: String::new()
        }
        .retryable());
        assert!(BridgeError::ServerUnavailable {
            server: "s".into(),
            message: "m".into()
        }
        .retryable());
        assert!(!BridgeError::Validation("x".into()).retryable());
        assert!(!BridgeError::Tool {
            server: "s".into(),
            message: "m".into()
        }
        .retryable());
    }

    #[test]
    fn unknown_server_suggests_close_name() {
        let err = BridgeError::UnknownServer {
            name: "weathr".into(),
            known: vec!["weather".into(), "sports".into()],
        };
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("weather"), "expected suggestion, got: {hint}");
    }

    #[test]
    fn unknown_server_no_suggestion_beyond_threshold() {
        let err = BridgeError::UnknownServer {
            name: "zzzzzz".into(),
            known: vec!["weather".into()],
        };
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn suggestion_only_for_unknown_server() {
        assert!(BridgeError::Validation("x".into()).suggestion().is_none());
    }

    #[test]
    fn run_status_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&RunStatus::ValidationError).unwrap(),
            "\"validation_error\""
        );
        assert_eq!(RunStatus::Timeout.as_str(), "timeout");
    }

    #[test]
    fn internal_is_display_transparent() {
        let err = BridgeError::Internal(anyhow::anyhow!("root cause"));
        assert_eq!(err.to_string(), "root cause");
    }
}

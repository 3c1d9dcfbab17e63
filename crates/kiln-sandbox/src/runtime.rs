//! Container runtime detection.

use kiln_error::BridgeError;

/// Runtimes probed when no explicit pin is configured, rootless-first.
const RUNTIME_CANDIDATES: [&str; 2] = ["podman", "docker"];

/// Locate a container runtime executable.
///
/// Probes the pinned name first (from `MCP_BRIDGE_RUNTIME`), then podman,
/// then docker, returning the first candidate found on `PATH`. Produces
/// only the command name; the launch arguments are assembled per-launch by
/// the container manager.
pub fn detect_runtime(pinned: Option<&str>) -> Result<String, BridgeError> {
    let mut probed: Vec<String> = Vec::new();
    for candidate in pinned.into_iter().chain(RUNTIME_CANDIDATES) {
        if probed.iter().any(|p| p == candidate) {
            continue;
        }
        probed.push(candidate.to_string());
        if which::which(candidate).is_ok() {
            tracing::debug!(runtime = candidate, "container runtime detected");
            return Ok(candidate.to_string());
        }
    }
    Err(BridgeError::RuntimeUnavailable { probed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_runtime_is_probed_first() {
        // `sh` exists on every Unix test host, so a pin on it must win over
        // the podman/docker candidates.
        let runtime = detect_runtime(Some("sh")).unwrap();
        assert_eq!(runtime, "sh");
    }

    #[test]
    fn missing_runtimes_name_every_probe() {
        temp_env::with_var("PATH", Some("/nonexistent-kiln-path"), || {
            let err = detect_runtime(Some("definitely-not-a-runtime")).unwrap_err();
            match &err {
                BridgeError::RuntimeUnavailable { probed } => {
                    assert_eq!(
                        probed,
                        &vec![
                            "definitely-not-a-runtime".to_string(),
                            "podman".to_string(),
                            "docker".to_string()
                        ]
                    );
                }
                other => panic!("expected RuntimeUnavailable, got: {other}"),
            }
            let msg = err.to_string();
            assert!(msg.contains("podman"), "should name probed runtimes: {msg}");
        });
    }

    #[test]
    fn duplicate_pin_not_probed_twice() {
        temp_env::with_var("PATH", Some("/nonexistent-kiln-path"), || {
            let err = detect_runtime(Some("podman")).unwrap_err();
            match err {
                BridgeError::RuntimeUnavailable { probed } => {
                    assert_eq!(probed, vec!["podman".to_string(), "docker".to_string()]);
                }
                other => panic!("expected RuntimeUnavailable, got: {other}"),
            }
        });
    }
}

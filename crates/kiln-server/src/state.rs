//! Host-side state directory and per-invocation IPC directories.
//!
//! Every invocation gets a scoped temp directory under the state root,
//! bind-mounted into the container at `/ipc`. Directories left behind by
//! crashed runs are pruned LRU at broker startup.

use std::path::{Path, PathBuf};

use kiln_config::BridgeSettings;
use kiln_error::BridgeError;

/// Prefix of per-invocation IPC directories under the state root.
pub const IPC_DIR_PREFIX: &str = "kiln-ipc-";

/// How many recent IPC directories the startup prune retains.
pub const MAX_RETAINED_IPC_DIRS: usize = 50;

/// The root for persistent state and IPC directories.
///
/// `MCP_BRIDGE_STATE_DIR` wins; otherwise `$HOME/MCPs`, falling back to a
/// kiln subdirectory of the system temp dir on homeless hosts.
pub fn resolve_state_dir(settings: &BridgeSettings) -> PathBuf {
    settings
        .state_dir
        .clone()
        .or_else(|| kiln_config::home_dir().map(|home| home.join("MCPs")))
        .unwrap_or_else(|| std::env::temp_dir().join("kiln"))
}

/// Remove old IPC directories beyond the most recent `keep`, LRU by mtime.
///
/// Best effort: unreadable entries are skipped, removal failures ignored.
/// Returns how many directories were removed.
pub fn prune_stale_ipc_dirs(base: &Path, keep: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(base) else {
        return 0;
    };

    let mut ipc_dirs: Vec<(PathBuf, std::time::SystemTime)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_string_lossy().starts_with(IPC_DIR_PREFIX)
                && entry.path().is_dir()
        })
        .filter_map(|entry| {
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), mtime))
        })
        .collect();

    if ipc_dirs.len() <= keep {
        return 0;
    }

    ipc_dirs.sort_by_key(|(_, mtime)| *mtime);
    let excess = ipc_dirs.len() - keep;
    let mut removed = 0;
    for (path, _) in ipc_dirs.into_iter().take(excess) {
        if std::fs::remove_dir_all(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(removed, kept = keep, "pruned stale IPC directories");
    }
    removed
}

/// A scoped IPC directory, removed when dropped.
#[derive(Debug)]
pub struct IpcDir {
    dir: tempfile::TempDir,
}

impl IpcDir {
    /// Create a fresh IPC directory under `base`.
    ///
    /// The directory is world-readable (0o755) so the unprivileged
    /// container user can traverse it.
    pub fn create(base: &Path) -> Result<Self, BridgeError> {
        std::fs::create_dir_all(base).map_err(|e| {
            BridgeError::Internal(anyhow::anyhow!(
                "failed to create state directory {}: {e}",
                base.display()
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(IPC_DIR_PREFIX)
            .tempdir_in(base)
            .map_err(|e| {
                BridgeError::Internal(anyhow::anyhow!(
                    "failed to create IPC directory under {}: {e}",
                    base.display()
                ))
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755));
        }

        Ok(Self { dir })
    }

    /// The host path of this directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

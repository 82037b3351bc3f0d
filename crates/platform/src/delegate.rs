//! Delegated file-open contract.
//!
//! The gateway must sometimes read a file that lives inside a user's
//! namespace (an `authorized_keys` file, typically). The production
//! implementation spawns a short-lived helper child inside that
//! namespace which opens the path and passes the descriptor back over a
//! SEQPACKET socket; that helper is outside this repository. The engine
//! only depends on this trait; [`LocalDelegatedOpen`] reads from the
//! server's own filesystem view.

use crate::{PassageError, PassageResult};
use std::path::{Path, PathBuf};

/// Opens a file on behalf of a user and returns its contents.
#[async_trait::async_trait]
pub trait DelegatedOpen: Send + Sync {
    /// Reads `path` as `user`, read-only. Paths are resolved inside the
    /// user's namespace by the implementation.
    async fn open_read_only(&self, user: &str, path: &Path) -> PassageResult<Vec<u8>>;
}

/// Reads from the local filesystem, optionally under a per-user root of
/// the form `root/<user>/<path>`.
#[derive(Debug, Default)]
pub struct LocalDelegatedOpen {
    /// When set, paths are resolved as `root/<user>/<path>`.
    pub root: Option<PathBuf>,
}

#[async_trait::async_trait]
impl DelegatedOpen for LocalDelegatedOpen {
    async fn open_read_only(&self, user: &str, path: &Path) -> PassageResult<Vec<u8>> {
        let resolved = match &self.root {
            Some(root) => {
                let relative = path.strip_prefix("/").unwrap_or(path);
                root.join(user).join(relative)
            }
            None => path.to_path_buf(),
        };

        tokio::fs::read(&resolved)
            .await
            .map_err(PassageError::Io)
    }
}

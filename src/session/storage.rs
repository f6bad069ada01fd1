//! On-disk layout of session scratch space.
//!
//! ```text
//! <storage_root>/
//!   <session_id>/          exclusively owned by one session
//!     source               staged download (deleted once output exists)
//!     source.part          in-progress download
//!     output/
//!       index.m3u8
//!       init.mp4
//!       seg0000.m4s ...
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use vidrelay_av::MANIFEST_NAME;
use vidrelay_common::{Error, Result, SessionId};

/// Paths belonging to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub staging: PathBuf,
    pub output_dir: PathBuf,
    pub manifest: PathBuf,
}

/// Deterministic mapping from session id to directory tree.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &SessionId) -> SessionPaths {
        let root = self.root.join(id.as_str());
        let output_dir = root.join("output");
        SessionPaths {
            staging: root.join("source"),
            manifest: output_dir.join(MANIFEST_NAME),
            output_dir,
            root,
        }
    }

    /// Create the session tree. The session directory itself must not exist
    /// yet, which keeps it exclusive to one session.
    pub async fn reserve(&self, id: &SessionId) -> Result<SessionPaths> {
        tokio::fs::create_dir_all(&self.root).await?;

        let paths = self.paths(id);
        match tokio::fs::create_dir(&paths.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateInFlight(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir(&paths.output_dir).await?;

        Ok(paths)
    }

    /// Recursively delete the session tree.
    ///
    /// Returns `Ok(false)` when there was nothing to delete, so repeated
    /// calls are harmless.
    pub async fn remove(&self, id: &SessionId) -> Result<bool> {
        let root = self.root.join(id.as_str());
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete session directories under the storage root that do not belong
    /// to a session in `live`. Entries whose names are not session ids are
    /// left alone. Returns how many directories were removed.
    pub async fn reconcile(&self, live: &HashSet<SessionId>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<SessionId>().ok())
            else {
                tracing::debug!("Skipping foreign entry {}", path.display());
                continue;
            };
            if live.contains(&id) {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                tracing::debug!("Skipping non-directory entry {}", path.display());
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    tracing::info!(session_id = %id, "Removed orphaned session storage {}", path.display());
                    removed += 1;
                }
                Err(e) => tracing::warn!("Failed to remove orphan {}: {e}", path.display()),
            }
        }

        Ok(removed)
    }

    /// Resolve a segment file name inside a session's output directory.
    ///
    /// Names that could escape the directory are reported as not found.
    pub fn segment_path(&self, id: &SessionId, name: &str) -> Result<PathBuf> {
        if !is_plain_file_name(name) {
            return Err(Error::not_found("segment", name));
        }
        Ok(self.paths(id).output_dir.join(name))
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

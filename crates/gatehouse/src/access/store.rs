//! Live-reloaded access store.
//!
//! The current [`AccessSnapshot`] sits behind an [`ArcSwap`]: readers take a
//! lock-free `Arc` to whichever snapshot is current, and a reload publishes a
//! whole new snapshot with a single pointer swap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, error, info};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AccessSnapshot;

/// Delay between the end of one reload and the start of the next.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Access store errors.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The access file could not be read.
    #[error("failed to read access file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a single reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new snapshot differs from the previous one.
    Changed,
    /// The file content is identical to the previous load.
    Unchanged,
}

/// Owner of the current access snapshot.
#[derive(Clone)]
pub struct AccessStore {
    path: Arc<PathBuf>,
    current: Arc<ArcSwap<AccessSnapshot>>,
}

impl std::fmt::Debug for AccessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AccessStore {
    /// Perform the initial load.
    ///
    /// Failure here is fatal for the caller: the gateway must not start
    /// serving with an unknown policy.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AccessError> {
        let path = path.into();
        let snapshot = read_snapshot(&path).await?;
        info!(
            "Loaded access list from {} ({} subjects, {} bypass tokens)",
            path.display(),
            snapshot.allowed_subjects().len(),
            snapshot.bypass_tokens().len()
        );
        Ok(Self {
            path: Arc::new(path),
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        })
    }

    /// Path of the backing access file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot current at the time of the call.
    ///
    /// Callers keep the returned `Arc` for the duration of one decision so a
    /// concurrent reload cannot change the policy underneath them.
    pub fn snapshot(&self) -> Arc<AccessSnapshot> {
        self.current.load_full()
    }

    /// Re-read the access file and publish the result.
    ///
    /// On error the previous snapshot stays current.
    pub async fn reload(&self) -> Result<ReloadOutcome, AccessError> {
        let current = Arc::new(read_snapshot(&self.path).await?);
        let previous = self.current.swap(Arc::clone(&current));

        if current.differs_from(&previous) {
            info!(
                "Loaded new access list ({} subjects, {} bypass tokens)",
                current.allowed_subjects().len(),
                current.bypass_tokens().len()
            );
            Ok(ReloadOutcome::Changed)
        } else {
            debug!("Access list unchanged");
            Ok(ReloadOutcome::Unchanged)
        }
    }

    /// Spawn the background reload loop.
    ///
    /// Reloads run back to back with `interval` of sleep between the end of
    /// one and the start of the next, so at most one is ever in flight.
    /// Failed reloads are logged and retried on the next tick. The loop
    /// exits when `shutdown` is cancelled.
    pub fn spawn_reloader(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Access reloader stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(err) = store.reload().await {
                    error!("Access list reload failed, keeping previous list: {}", err);
                }
            }
        })
    }
}

async fn read_snapshot(path: &Path) -> Result<AccessSnapshot, AccessError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AccessError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(AccessSnapshot::parse(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn access_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn open_fails_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AccessStore::open(dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Read { .. }));
        assert!(err.to_string().contains("missing.txt"));
    }

    #[tokio::test]
    async fn open_loads_initial_snapshot() {
        let file = access_file("# comment\nalice\n%secret123\n");
        let store = AccessStore::open(file.path()).await.unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.is_subject_allowed("alice"));
        assert!(snapshot.is_bypass_token(b"secret123"));
    }

    #[tokio::test]
    async fn reload_reports_changes_only_when_content_differs() {
        let file = access_file("alice\n");
        let store = AccessStore::open(file.path()).await.unwrap();

        assert_eq!(store.reload().await.unwrap(), ReloadOutcome::Unchanged);

        std::fs::write(file.path(), "alice\nbob\n").unwrap();
        assert_eq!(store.reload().await.unwrap(), ReloadOutcome::Changed);
        assert!(store.snapshot().is_subject_allowed("bob"));

        assert_eq!(store.reload().await.unwrap(), ReloadOutcome::Unchanged);

        std::fs::write(file.path(), "bob\nalice\n").unwrap();
        assert_eq!(store.reload().await.unwrap(), ReloadOutcome::Changed);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.txt");
        std::fs::write(&path, "alice\n").unwrap();
        let store = AccessStore::open(&path).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(store.reload().await.is_err());
        assert!(store.snapshot().is_subject_allowed("alice"));
    }

    #[tokio::test]
    async fn held_snapshot_is_unaffected_by_reload() {
        let file = access_file("alice\n");
        let store = AccessStore::open(file.path()).await.unwrap();
        let held = store.snapshot();

        std::fs::write(file.path(), "bob\n").unwrap();
        store.reload().await.unwrap();

        assert!(held.is_subject_allowed("alice"));
        assert!(!store.snapshot().is_subject_allowed("alice"));
    }

    #[tokio::test]
    async fn reloader_picks_up_changes_and_stops_on_cancel() {
        let file = access_file("alice\n");
        let store = AccessStore::open(file.path()).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = store.spawn_reloader(Duration::from_millis(20), shutdown.clone());

        std::fs::write(file.path(), "bob\n").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !store.snapshot().is_subject_allowed("bob") {
            assert!(tokio::time::Instant::now() < deadline, "reload never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.snapshot().is_subject_allowed("alice"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Workspace provisioning.
//!
//! A workspace is the isolated environment a task's worker runs in. The
//! supervisor is the only party that acquires and releases workspaces; it
//! holds each one through a [`WorkspaceLease`] so the workspace is released
//! exactly once on every exit path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use batchrun_core::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the marker file written into every directory workspace.
pub const LEASE_MARKER: &str = ".batchrun-lease";

/// Errors raised by workspace provisioners.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace unavailable: {0}")]
    Unavailable(String),
}

impl WorkspaceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Opaque reference to an allocated workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceHandle {
    id: String,
    path: PathBuf,
}

impl WorkspaceHandle {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory the worker runs in.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Allocates and destroys isolated workspaces.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Allocate a fresh workspace for a task.
    async fn acquire(&self, task_id: &TaskId) -> Result<WorkspaceHandle, WorkspaceError>;

    /// Destroy a workspace.
    async fn release(&self, handle: WorkspaceHandle) -> Result<(), WorkspaceError>;

    /// Destroy workspaces left behind by a supervisor that died.
    ///
    /// Returns the number of workspaces removed.
    async fn recover_stale(&self) -> Result<usize, WorkspaceError> {
        Ok(0)
    }
}

/// Scoped ownership of one workspace.
///
/// Call [`WorkspaceLease::release`] on the normal path. A lease that is
/// dropped unreleased schedules the release on the current runtime.
pub struct WorkspaceLease {
    handle: WorkspaceHandle,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    released: bool,
}

impl WorkspaceLease {
    /// Acquire a workspace for `task_id`.
    pub async fn acquire(
        provisioner: Arc<dyn WorkspaceProvisioner>,
        task_id: &TaskId,
    ) -> Result<Self, WorkspaceError> {
        let handle = provisioner.acquire(task_id).await?;
        debug!(task_id = %task_id, workspace = %handle.path().display(), "Workspace acquired");
        Ok(Self {
            handle,
            provisioner,
            released: false,
        })
    }

    pub fn handle(&self) -> &WorkspaceHandle {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Release the workspace. Consumes the lease so it cannot be released twice.
    pub async fn release(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        let handle = self.handle.clone();
        debug!(workspace = %handle.path().display(), "Releasing workspace");
        self.provisioner.release(handle).await
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = self.handle.clone();
        let provisioner = self.provisioner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(workspace = %handle.path().display(), "Workspace lease dropped without release");
                runtime.spawn(async move {
                    if let Err(e) = provisioner.release(handle).await {
                        warn!(error = %e, "Deferred workspace release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    workspace = %handle.path().display(),
                    "Workspace lease dropped outside a runtime; left for stale recovery"
                );
            }
        }
    }
}

/// Lease marker contents.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseMarker {
    task_id: String,
    pid: u32,
    created_at: DateTime<Utc>,
}

/// Provisions one fresh directory per task under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a task: a filesystem-safe prefix plus a random suffix.
    fn dir_name(task_id: &TaskId) -> String {
        let prefix: String = task_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(48)
            .collect();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", prefix, &suffix[..8])
    }

    async fn write_marker(dir: &Path, task_id: &TaskId) -> Result<(), WorkspaceError> {
        let marker = LeaseMarker {
            task_id: task_id.to_string(),
            pid: std::process::id(),
            created_at: Utc::now(),
        };
        let marker_json = serde_json::to_string(&marker)
            .map_err(|e| WorkspaceError::Unavailable(e.to_string()))?;
        let marker_path = dir.join(LEASE_MARKER);
        tokio::fs::write(&marker_path, marker_json)
            .await
            .map_err(|e| WorkspaceError::io(&marker_path, e))
    }

    async fn read_marker(dir: &Path) -> Option<LeaseMarker> {
        let text = tokio::fs::read_to_string(dir.join(LEASE_MARKER)).await.ok()?;
        serde_json::from_str(&text).ok()
    }
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn acquire(&self, task_id: &TaskId) -> Result<WorkspaceHandle, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorkspaceError::io(&self.root, e))?;

        let name = Self::dir_name(task_id);
        let path = self.root.join(&name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| WorkspaceError::io(&path, e))?;

        // An unmarked directory is never recovered, so do not leave one behind.
        if let Err(e) = Self::write_marker(&path, task_id).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&path).await {
                warn!(workspace = %path.display(), error = %cleanup, "Failed to remove unmarked workspace");
            }
            return Err(e);
        }

        Ok(WorkspaceHandle::new(name, path))
    }

    async fn release(&self, handle: WorkspaceHandle) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(handle.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(workspace = %handle.path().display(), "Workspace already gone");
                Ok(())
            }
            Err(e) => Err(WorkspaceError::io(handle.path(), e)),
        }
    }

    async fn recover_stale(&self) -> Result<usize, WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(WorkspaceError::io(&self.root, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(&self.root, e))?
        {
            let path = entry.path();
            let Some(marker) = Self::read_marker(&path).await else {
                continue;
            };
            if process_alive(marker.pid) {
                continue;
            }
            info!(
                workspace = %path.display(),
                task_id = %marker.task_id,
                owner_pid = marker.pid,
                "Removing stale workspace"
            );
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| WorkspaceError::io(&path, e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the process exists.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(DirectoryProvisioner::new(root.path()));

        let lease = WorkspaceLease::acquire(provisioner.clone(), &id("feature/login"))
            .await
            .unwrap();
        let path = lease.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path.join(LEASE_MARKER).is_file());
        assert!(lease.handle().id().starts_with("feature_login-"));

        lease.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_workspaces_are_distinct() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::new(root.path());

        let a = provisioner.acquire(&id("same")).await.unwrap();
        let b = provisioner.acquire(&id("same")).await.unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(DirectoryProvisioner::new(root.path()));

        let lease = WorkspaceLease::acquire(provisioner, &id("dropped")).await.unwrap();
        let path = lease.path().to_path_buf();
        drop(lease);

        for _ in 0..50 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("workspace was not released after drop");
    }

    #[tokio::test]
    async fn test_recover_stale_skips_live_owner() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::new(root.path());

        let live = provisioner.acquire(&id("live")).await.unwrap();

        // Simulate a workspace left by a dead supervisor.
        let stale = root.path().join("stale-0000");
        std::fs::create_dir(&stale).unwrap();
        let marker = LeaseMarker {
            task_id: "stale".to_string(),
            pid: u32::MAX,
            created_at: Utc::now(),
        };
        std::fs::write(stale.join(LEASE_MARKER), serde_json::to_string(&marker).unwrap()).unwrap();

        // Unmarked directories are never touched.
        let foreign = root.path().join("not-ours");
        std::fs::create_dir(&foreign).unwrap();

        let removed = provisioner.recover_stale().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(live.path().exists());
        assert!(foreign.exists());
    }

    /// Extend `base` with nested components until the path is exactly `len` bytes.
    #[cfg(target_os = "linux")]
    fn path_of_len(base: &Path, len: usize) -> PathBuf {
        let mut path = base.to_path_buf();
        loop {
            let remaining = len - path.as_os_str().len();
            if remaining == 0 {
                return path;
            }
            // Each component costs one extra byte for the separator.
            let take = if remaining > 202 {
                200
            } else if remaining > 101 {
                remaining / 2
            } else {
                remaining - 1
            };
            path.push("d".repeat(take));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_marker_write_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        // The workspace directory fits within PATH_MAX but its marker file does not.
        let root = path_of_len(base.path(), 4076);
        std::fs::create_dir_all(&root).unwrap();
        let provisioner = DirectoryProvisioner::new(&root);

        let result = provisioner.acquire(&id("t")).await;
        assert!(matches!(result, Err(WorkspaceError::Io { .. })));
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_recover_missing_root() {
        let provisioner = DirectoryProvisioner::new("/nonexistent/batchrun-test-root");
        assert_eq!(provisioner.recover_stale().await.unwrap(), 0);
    }
}

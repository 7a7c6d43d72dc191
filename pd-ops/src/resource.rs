//! Temporary artifact lifecycle.
//!
//! Every file or directory the pipeline creates lives under one working
//! directory and is represented by a [`ResourceHandle`]. Handles are registered
//! in the [`ResourceGuard`] at allocation time and deleted exactly once: when
//! released explicitly, when the owning session is reset, when the enclosing
//! [`ResourceScope`] ends, or when the handle itself is dropped, whichever
//! happens first.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const ARTIFACT_PREFIX: &str = "pdfdesk-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    Intermediate,
    Output,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Intermediate => "intermediate",
            Self::Output => "output",
        }
    }
}

#[derive(Debug)]
struct LiveEntry {
    session_id: String,
    path: PathBuf,
    role: Role,
    is_dir: bool,
}

struct GuardInner {
    work_dir: PathBuf,
    live: DashMap<Uuid, LiveEntry>,
    released: AtomicU64,
    release_failures: AtomicU64,
}

impl GuardInner {
    /// Removes the registry entry and deletes the artifact. Only the caller
    /// that wins the registry removal touches the filesystem.
    fn release_id(&self, id: Uuid) -> bool {
        let Some((_, entry)) = self.live.remove(&id) else {
            return false;
        };
        let result = if entry.is_dir {
            std::fs::remove_dir_all(&entry.path)
        } else {
            std::fs::remove_file(&entry.path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.release_failures.fetch_add(1, Ordering::Relaxed);
                let err = PipelineError::LeakGuard(format!("{}: {e}", entry.path.display()));
                tracing::warn!(
                    error = %err,
                    session = %entry.session_id,
                    role = entry.role.as_str(),
                    "failed to delete temporary artifact"
                );
            }
        }
        self.released.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Registry of every live temporary artifact.
#[derive(Clone)]
pub struct ResourceGuard {
    inner: Arc<GuardInner>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GuardStats {
    pub live: usize,
    pub released: u64,
    pub release_failures: u64,
}

impl ResourceGuard {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        if work_dir.as_os_str().is_empty() {
            return Err(PipelineError::Validation(
                "work_dir is required".to_string(),
            ));
        }
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            inner: Arc::new(GuardInner {
                work_dir,
                live: DashMap::new(),
                released: AtomicU64::new(0),
                release_failures: AtomicU64::new(0),
            }),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.work_dir
    }

    /// Allocates a fresh unique file path. The file itself is not created.
    pub fn acquire(&self, session_id: &str, role: Role, suffix: &str) -> ResourceHandle {
        let id = Uuid::new_v4();
        let path = self
            .inner
            .work_dir
            .join(format!("{ARTIFACT_PREFIX}{}{}", id.simple(), suffix));
        self.register(id, session_id, path, role, false)
    }

    /// Allocates and creates an empty directory.
    pub fn acquire_dir(&self, session_id: &str, role: Role) -> Result<ResourceHandle> {
        let id = Uuid::new_v4();
        let path = self
            .inner
            .work_dir
            .join(format!("{ARTIFACT_PREFIX}{}.d", id.simple()));
        // Register before touching the filesystem so a failed mkdir is still
        // cleaned up through the normal path.
        let handle = self.register(id, session_id, path, role, true);
        std::fs::create_dir(handle.path())?;
        Ok(handle)
    }

    fn register(
        &self,
        id: Uuid,
        session_id: &str,
        path: PathBuf,
        role: Role,
        is_dir: bool,
    ) -> ResourceHandle {
        self.inner.live.insert(
            id,
            LiveEntry {
                session_id: session_id.to_string(),
                path: path.clone(),
                role,
                is_dir,
            },
        );
        tracing::trace!(session = %session_id, role = role.as_str(), path = %path.display(), "artifact registered");
        ResourceHandle {
            id,
            path,
            role,
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            guard: self.inner.clone(),
        }
    }

    /// Deletes the artifact behind `handle`. Idempotent.
    pub fn release(&self, handle: &ResourceHandle) -> bool {
        self.inner.release_id(handle.id)
    }

    /// Releases every artifact still registered for `session_id`.
    pub fn release_all(&self, session_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .inner
            .live
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.inner.release_id(*id))
            .count()
    }

    /// Opens a scope whose acquisitions are released when it is dropped.
    pub fn scope(&self, session_id: &str) -> ResourceScope {
        ResourceScope {
            guard: self.clone(),
            session_id: session_id.to_string(),
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub fn live_count(&self, session_id: &str) -> usize {
        self.inner
            .live
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .count()
    }

    pub fn live_total(&self) -> usize {
        self.inner.live.len()
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            live: self.inner.live.len(),
            released: self.inner.released.load(Ordering::Relaxed),
            release_failures: self.inner.release_failures.load(Ordering::Relaxed),
        }
    }

    /// Deletes artifacts left behind by a previous process. Only entries
    /// carrying the artifact prefix are touched; currently registered
    /// artifacts are skipped.
    pub fn sweep_stale(&self) -> Result<usize> {
        let live: Vec<PathBuf> = self
            .inner
            .live
            .iter()
            .map(|entry| entry.value().path.clone())
            .collect();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.inner.work_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(ARTIFACT_PREFIX) {
                continue;
            }
            let path = entry.path();
            if live.contains(&path) {
                continue;
            }
            let result = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "failed to sweep stale artifact");
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, work_dir = %self.inner.work_dir.display(), "swept stale artifacts");
        }
        Ok(removed)
    }
}

/// One temporary artifact. Not clonable: dropping it releases the artifact.
pub struct ResourceHandle {
    id: Uuid,
    path: PathBuf,
    role: Role,
    session_id: String,
    created_at: DateTime<Utc>,
    guard: Arc<GuardInner>,
}

impl ResourceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }

    pub fn is_released(&self) -> bool {
        !self.guard.live.contains_key(&self.id)
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.guard.release_id(self.id);
    }
}

/// Scoped acquisition capability for one job.
///
/// Everything acquired through the scope is released when the scope ends,
/// except handles handed onward with [`ResourceScope::detach`].
pub struct ResourceScope {
    guard: ResourceGuard,
    session_id: String,
    acquired: Mutex<Vec<Uuid>>,
}

impl ResourceScope {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn acquire(&self, role: Role, suffix: &str) -> ResourceHandle {
        let handle = self.guard.acquire(&self.session_id, role, suffix);
        self.track(handle.id);
        handle
    }

    pub fn acquire_dir(&self, role: Role) -> Result<ResourceHandle> {
        let handle = self.guard.acquire_dir(&self.session_id, role)?;
        self.track(handle.id);
        Ok(handle)
    }

    /// Nested scope on the same guard, released independently.
    pub fn child(&self) -> ResourceScope {
        self.guard.scope(&self.session_id)
    }

    /// Stops tracking `handles`; their lifetime is now tied to the handle
    /// values alone.
    pub fn detach(&self, handles: &[ResourceHandle]) {
        if let Ok(mut acquired) = self.acquired.lock() {
            acquired.retain(|id| !handles.iter().any(|h| h.id == *id));
        }
    }

    fn track(&self, id: Uuid) {
        if let Ok(mut acquired) = self.acquired.lock() {
            acquired.push(id);
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        let ids = match self.acquired.get_mut() {
            Ok(ids) => std::mem::take(ids),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for id in ids {
            self.guard.inner.release_id(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (tempfile::TempDir, ResourceGuard) {
        let dir = tempfile::tempdir().unwrap();
        let guard = ResourceGuard::new(dir.path().join("work")).unwrap();
        (dir, guard)
    }

    #[test]
    fn release_is_idempotent_and_tolerates_missing_files() {
        let (_dir, guard) = guard();
        let handle = guard.acquire("s1", Role::Input, ".pdf");
        assert!(!handle.path().exists());
        assert_eq!(guard.live_count("s1"), 1);

        assert!(guard.release(&handle));
        assert!(!guard.release(&handle));
        assert!(handle.is_released());
        assert_eq!(guard.stats().release_failures, 0);
    }

    #[test]
    fn failed_delete_is_counted_and_not_retried() {
        let (_dir, guard) = guard();
        let handle = guard.acquire("s1", Role::Output, ".pdf");
        // remove_file cannot delete a directory, even as root.
        std::fs::create_dir(handle.path()).unwrap();
        std::fs::write(handle.path().join("inner"), b"x").unwrap();
        let path = handle.path().to_path_buf();

        assert!(guard.release(&handle));
        let stats = guard.stats();
        assert_eq!(stats.release_failures, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(guard.live_count("s1"), 0);
        assert_eq!(guard.live_total(), 0);

        drop(handle);
        assert_eq!(guard.stats().release_failures, 1);
        assert!(path.exists());
    }

    #[test]
    fn dropping_handle_deletes_file() {
        let (_dir, guard) = guard();
        let handle = guard.acquire("s1", Role::Output, ".txt");
        std::fs::write(handle.path(), b"data").unwrap();
        let path = handle.path().to_path_buf();
        drop(handle);
        assert!(!path.exists());
        assert_eq!(guard.live_count("s1"), 0);
    }

    #[test]
    fn release_all_only_touches_the_given_session() {
        let (_dir, guard) = guard();
        let a = guard.acquire("a", Role::Input, ".pdf");
        let _b = guard.acquire("a", Role::Input, ".pdf");
        let other = guard.acquire("b", Role::Input, ".pdf");
        std::fs::write(a.path(), b"x").unwrap();
        std::fs::write(other.path(), b"y").unwrap();

        assert_eq!(guard.release_all("a"), 2);
        assert!(!a.path().exists());
        assert!(other.path().exists());
        assert_eq!(guard.live_count("a"), 0);
        assert_eq!(guard.live_count("b"), 1);
    }

    #[test]
    fn scope_releases_everything_except_detached_handles() {
        let (_dir, guard) = guard();
        let kept;
        {
            let scope = guard.scope("s1");
            let scratch = scope.acquire_dir(Role::Intermediate).unwrap();
            std::fs::write(scratch.path().join("page-1.jpg"), b"jpg").unwrap();
            let output = scope.acquire(Role::Output, ".zip");
            std::fs::write(output.path(), b"zip").unwrap();
            scope.detach(std::slice::from_ref(&output));
            kept = output;
            // Leaked through mem::forget: the scope still owns its release.
            std::mem::forget(scratch);
            assert_eq!(guard.live_count("s1"), 2);
        }
        assert_eq!(guard.live_count("s1"), 1);
        assert!(kept.path().exists());
        drop(kept);
        assert_eq!(guard.live_count("s1"), 0);
    }

    #[test]
    fn sweep_removes_only_prefixed_unregistered_artifacts() {
        let (_dir, guard) = guard();
        let work = guard.work_dir().to_path_buf();
        std::fs::write(work.join("pdfdesk-stale.pdf"), b"old").unwrap();
        std::fs::create_dir(work.join("pdfdesk-stale.d")).unwrap();
        std::fs::write(work.join("unrelated.txt"), b"keep").unwrap();
        let live = guard.acquire("s1", Role::Input, ".pdf");
        std::fs::write(live.path(), b"live").unwrap();

        assert_eq!(guard.sweep_stale().unwrap(), 2);
        assert!(work.join("unrelated.txt").exists());
        assert!(live.path().exists());
    }
}

//! Registry of sync sessions keyed by run id.
//!
//! A [`SyncManager`] owns at most one [`SyncSession`] per run. All sessions
//! share one [`Emitter`] and one set of [`SyncOptions`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use workmirror_sync::emitter::StdoutEmitter;
//! use workmirror_sync::manager::SyncManager;
//! use workmirror_sync::session::SyncOptions;
//!
//! # async fn example() -> workmirror_sync::Result<()> {
//! let manager = SyncManager::new(Arc::new(StdoutEmitter), SyncOptions::default());
//! manager.start_sync("run-1", "/path/to/workspace").await?;
//!
//! // Before writing files that came from the other side
//! manager.mark_synced_from_local("run-1", &["src/main.rs"]).await;
//!
//! manager.dispose_all().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::emitter::Emitter;
use crate::error::Result;
use crate::ignore_rules::IgnoreMatcher;
use crate::session::{SyncOptions, SyncSession};

/// Registry of running sync sessions.
pub struct SyncManager {
    sessions: Mutex<HashMap<String, Arc<SyncSession>>>,
    emitter: Arc<dyn Emitter>,
    options: SyncOptions,
}

impl SyncManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(emitter: Arc<dyn Emitter>, options: SyncOptions) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            emitter,
            options,
        }
    }

    /// Starts syncing `workspace_path` under `run_id`.
    ///
    /// Does nothing if a session for `run_id` already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the ignore rules cannot be compiled or the watch
    /// cannot be established. Nothing is registered in that case.
    pub async fn start_sync(
        &self,
        run_id: &str,
        workspace_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(run_id) {
            debug!(run_id, "Sync already running, ignoring start");
            return Ok(());
        }

        let workspace_path = workspace_path.into();
        let ignore =
            IgnoreMatcher::build_with_file(&workspace_path, &self.options.ignore_file)?;

        let session = SyncSession::new(
            run_id,
            workspace_path,
            Arc::new(ignore),
            Arc::clone(&self.emitter),
            self.options.clone(),
        );
        session.start().await?;

        sessions.insert(run_id.to_string(), Arc::new(session));
        info!(run_id, active = sessions.len(), "Started sync");

        Ok(())
    }

    /// Stops and removes the session for `run_id`, if any.
    pub async fn stop_sync(&self, run_id: &str) {
        let session = self.sessions.lock().await.remove(run_id);
        if let Some(session) = session {
            session.dispose().await;
            info!(run_id, "Stopped sync");
        }
    }

    /// Suppresses echoes of `relative_paths` in the session for `run_id`.
    pub async fn mark_synced_from_local<S: AsRef<str>>(&self, run_id: &str, relative_paths: &[S]) {
        let Some(session) = self.session(run_id).await else {
            debug!(run_id, "No sync session to mark paths in");
            return;
        };

        for path in relative_paths {
            session.mark_synced_from_local(path.as_ref());
        }
    }

    /// Suppresses echoes of `relative_paths` in every session.
    ///
    /// For writers that do not know which run a path belongs to.
    pub async fn mark_synced_from_local_all_sessions<S: AsRef<str>>(&self, relative_paths: &[S]) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            for path in relative_paths {
                session.mark_synced_from_local(path.as_ref());
            }
        }
    }

    /// Disposes every session concurrently and clears the registry.
    pub async fn dispose_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }

        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.dispose())).await;
        info!(sessions = count, "Disposed all sync sessions");
    }

    /// Returns the session for `run_id`.
    pub async fn session(&self, run_id: &str) -> Option<Arc<SyncSession>> {
        self.sessions.lock().await.get(run_id).cloned()
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Run ids of all registered sessions, sorted.
    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::ChannelEmitter;
    use crate::error::SyncError;
    use crate::types::ChangeAction;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_manager() -> (SyncManager, mpsc::Receiver<crate::types::SyncBatch>) {
        let (tx, rx) = mpsc::channel(16);
        let options = SyncOptions {
            debounce: Duration::from_secs(60),
            stabilization: None,
            ..SyncOptions::default()
        };
        (SyncManager::new(Arc::new(ChannelEmitter::new(tx)), options), rx)
    }

    #[tokio::test]
    async fn test_start_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-1", dir.path()).await.unwrap();
        let first = manager.session("run-1").await.unwrap();

        manager.start_sync("run-1", dir.path()).await.unwrap();
        let second = manager.session("run-1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.session_count().await, 1);
        assert!(first.is_watching());

        manager.dispose_all().await;
    }

    #[tokio::test]
    async fn test_start_sync_missing_workspace() {
        let dir = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        let result = manager.start_sync("run-1", dir.path().join("missing")).await;

        assert!(matches!(result, Err(SyncError::Watcher(_))));
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_sync_disposes_and_removes() {
        let dir = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-1", dir.path()).await.unwrap();
        let session = manager.session("run-1").await.unwrap();

        manager.stop_sync("run-1").await;

        assert!(session.is_disposed());
        assert!(!session.is_watching());
        assert!(manager.session("run-1").await.is_none());

        // Unknown run is a no-op
        manager.stop_sync("run-unknown").await;
    }

    #[tokio::test]
    async fn test_mark_synced_targets_one_session() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-a", a.path()).await.unwrap();
        manager.start_sync("run-b", b.path()).await.unwrap();

        manager.mark_synced_from_local("run-a", &["shared.txt"]).await;
        manager.mark_synced_from_local("run-unknown", &["shared.txt"]).await;

        let session_a = manager.session("run-a").await.unwrap();
        let session_b = manager.session("run-b").await.unwrap();
        session_a.record_change(&a.path().join("shared.txt"), ChangeAction::Write);
        session_b.record_change(&b.path().join("shared.txt"), ChangeAction::Write);

        assert_eq!(session_a.pending_len(), 0);
        assert_eq!(session_b.pending_paths(), vec!["shared.txt"]);

        manager.dispose_all().await;
    }

    #[tokio::test]
    async fn test_mark_synced_all_sessions() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-a", a.path()).await.unwrap();
        manager.start_sync("run-b", b.path()).await.unwrap();

        manager
            .mark_synced_from_local_all_sessions(&["x.txt".to_string()])
            .await;

        let session_a = manager.session("run-a").await.unwrap();
        let session_b = manager.session("run-b").await.unwrap();
        session_a.record_change(&a.path().join("x.txt"), ChangeAction::Write);
        session_b.record_change(&b.path().join("x.txt"), ChangeAction::Write);

        assert_eq!(session_a.pending_len(), 0);
        assert_eq!(session_b.pending_len(), 0);

        manager.dispose_all().await;
    }

    #[tokio::test]
    async fn test_dispose_all_clears_registry() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-b", b.path()).await.unwrap();
        manager.start_sync("run-a", a.path()).await.unwrap();
        assert_eq!(manager.run_ids().await, vec!["run-a", "run-b"]);

        let sessions = [
            manager.session("run-a").await.unwrap(),
            manager.session("run-b").await.unwrap(),
        ];

        manager.dispose_all().await;

        assert_eq!(manager.session_count().await, 0);
        assert!(sessions.iter().all(|s| s.is_disposed()));

        // Empty registry
        manager.dispose_all().await;
    }

    #[tokio::test]
    async fn test_workspace_ignore_file_applied() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "secret.env\n").unwrap();
        let (manager, _rx) = test_manager();

        manager.start_sync("run-1", dir.path()).await.unwrap();
        let session = manager.session("run-1").await.unwrap();

        session.record_change(&dir.path().join("secret.env"), ChangeAction::Write);
        session.record_change(&dir.path().join("public.txt"), ChangeAction::Write);

        assert_eq!(session.pending_paths(), vec!["public.txt"]);

        manager.dispose_all().await;
    }
}

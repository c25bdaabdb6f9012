//! One-directional sync session for a single workspace.
//!
//! A [`SyncSession`] watches a workspace, records every relevant change in an
//! ordered pending map (one entry per path, later events replace the action
//! but keep the position), and flushes the map after a quiet period. A flush
//! reads and encodes written files, splits the result into size-bounded
//! batches and hands each batch to the session's [`Emitter`]. If delivery
//! fails, the drained changes go back into the pending map and a retry is
//! scheduled.
//!
//! # Echo suppression
//!
//! When the opposite direction writes a file that came from the other side,
//! it first calls [`SyncSession::mark_synced_from_local`]. Events for that
//! path are dropped for the echo TTL so the write is not sent straight back.
//!
//! # Concurrency
//!
//! Session state lives behind a mutex that is never held across an await.
//! Watch events are consumed by one task per session, so they are recorded
//! in arrival order. Flushes run as their own tasks and may overlap with new
//! events; the `syncing` flag only prevents two flushes running at once.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{Batch, BatchLimits};
use crate::echo::{EchoSuppressor, DEFAULT_ECHO_TTL_MS};
use crate::emitter::{EmitError, Emitter};
use crate::ignore_rules::IgnoreMatcher;
use crate::types::{normalize_relative_path, ChangeAction, PendingChange, SyncBatch, WorkerSyncFile};
use crate::utils::debounce::{Debouncer, DEFAULT_DEBOUNCE_MS};
use crate::watcher::{IgnorePredicate, WatchEvent, WatcherError, WorkspaceWatcher, WriteStabilization};

/// Default delay before retrying a failed flush, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Default upper bound on a single emitter call, in seconds.
pub const DEFAULT_EMIT_TIMEOUT_SECS: u64 = 60;

/// Capacity of the channel between the watcher and the session.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Timings and limits shared by all sessions of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Quiet period after the last recorded change before a flush.
    pub debounce: Duration,

    /// Delay before retrying a flush whose emission failed.
    pub retry_delay: Duration,

    /// How long a path stays suppressed after `mark_synced_from_local`.
    pub echo_ttl: Duration,

    /// Upper bound on one emitter call; `None` waits indefinitely.
    pub emit_timeout: Option<Duration>,

    /// Write stabilization for the watcher; `None` reports events immediately.
    pub stabilization: Option<WriteStabilization>,

    /// Batch size bounds.
    pub limits: BatchLimits,

    /// Name of the ignore file inside each workspace.
    pub ignore_file: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            echo_ttl: Duration::from_millis(DEFAULT_ECHO_TTL_MS),
            emit_timeout: Some(Duration::from_secs(DEFAULT_EMIT_TIMEOUT_SECS)),
            stabilization: Some(WriteStabilization::default()),
            limits: BatchLimits::default(),
            ignore_file: crate::ignore_rules::DEFAULT_IGNORE_FILE.to_string(),
        }
    }
}

/// Mutable state of a session.
#[derive(Debug)]
struct SessionState {
    pending: IndexMap<String, PendingChange>,
    recently_synced_from_local: EchoSuppressor,
    syncing: bool,
    disposed: bool,
    flush_timer: Debouncer,
    retry_timer: Debouncer,
}

/// Immutable configuration plus shared state, owned by the session and its tasks.
struct SessionInner {
    run_id: String,
    workspace_path: PathBuf,
    /// Canonical form of `workspace_path`, when it differs. Resolved on start.
    canonical_root: OnceLock<PathBuf>,
    ignore: Arc<IgnoreMatcher>,
    emitter: Arc<dyn Emitter>,
    options: SyncOptions,
    state: Mutex<SessionState>,
}

/// The running watch: the watcher and the task consuming its events.
struct WatchHandle {
    watcher: WorkspaceWatcher,
    consumer: tokio::task::JoinHandle<()>,
}

/// One-directional sync session for one workspace, keyed by run id.
pub struct SyncSession {
    inner: Arc<SessionInner>,
    watch: Mutex<Option<WatchHandle>>,
}

impl SyncSession {
    /// Creates a session without starting the watch.
    ///
    /// # Arguments
    ///
    /// * `run_id` - Identifier of the run this workspace belongs to
    /// * `workspace_path` - Root of the workspace
    /// * `ignore` - Compiled ignore rules for the workspace
    /// * `emitter` - Destination for finished batches
    /// * `options` - Timings and limits
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
        ignore: Arc<IgnoreMatcher>,
        emitter: Arc<dyn Emitter>,
        options: SyncOptions,
    ) -> Self {
        let workspace_path = workspace_path.into();

        let state = SessionState {
            pending: IndexMap::new(),
            recently_synced_from_local: EchoSuppressor::new(options.echo_ttl),
            syncing: false,
            disposed: false,
            flush_timer: Debouncer::new(),
            retry_timer: Debouncer::new(),
        };

        Self {
            inner: Arc::new(SessionInner {
                run_id: run_id.into(),
                workspace_path,
                canonical_root: OnceLock::new(),
                ignore,
                emitter,
                options,
                state: Mutex::new(state),
            }),
            watch: Mutex::new(None),
        }
    }

    /// Starts watching the workspace.
    ///
    /// Does nothing if the session is disposed or already watching.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be established.
    pub async fn start(&self) -> Result<(), WatcherError> {
        if self.inner.state().disposed || lock(&self.watch).is_some() {
            return Ok(());
        }

        // Backends may report resolved paths when the root sits behind a symlink
        if let Ok(canonical) = tokio::fs::canonicalize(&self.inner.workspace_path).await {
            if canonical != self.inner.workspace_path {
                let _ = self.inner.canonical_root.set(canonical);
            }
        }

        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let watcher = WorkspaceWatcher::new(
            self.inner.workspace_path.clone(),
            self.inner.watch_ignore_predicate(),
            self.inner.options.stabilization,
            tx,
        )
        .await?;

        let inner = Arc::clone(&self.inner);
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    WatchEvent::Add(path) | WatchEvent::Change(path) => {
                        inner.record_change(&path, ChangeAction::Write);
                    }
                    WatchEvent::Unlink(path) => {
                        inner.record_change(&path, ChangeAction::Delete);
                    }
                }
            }
        });

        let handle = WatchHandle { watcher, consumer };
        let rejected = {
            let mut watch = lock(&self.watch);
            if self.inner.state().disposed || watch.is_some() {
                Some(handle)
            } else {
                *watch = Some(handle);
                None
            }
        };

        // Disposed, or started concurrently, while the watch was being set up
        if let Some(WatchHandle { watcher, consumer }) = rejected {
            watcher.close().await;
            consumer.abort();
            return Ok(());
        }

        info!(
            run_id = %self.inner.run_id,
            workspace = %self.inner.workspace_path.display(),
            "Sync session watching"
        );

        Ok(())
    }

    /// Suppresses events for `relative_path` for the echo TTL.
    ///
    /// Must be called immediately before writing a file that originated on
    /// the other side.
    pub fn mark_synced_from_local(&self, relative_path: &str) {
        let normalized = normalize_relative_path(relative_path);
        trace!(run_id = %self.inner.run_id, path = %normalized, "Marked as synced from local");
        self.inner
            .state()
            .recently_synced_from_local
            .mark(&normalized);
    }

    /// Records a change observed at `absolute_path`.
    ///
    /// Called by the watch consumer for every event. Exposed so that hosts
    /// with their own change feed can drive a session without a watch.
    pub fn record_change(&self, absolute_path: &Path, action: ChangeAction) {
        self.inner.record_change(absolute_path, action);
    }

    /// Stops the session: cancels timers and closes the watch.
    ///
    /// A flush already in progress runs to completion but schedules nothing
    /// further. Safe to call more than once.
    pub async fn dispose(&self) {
        {
            let mut state = self.inner.state();
            if !state.disposed {
                debug!(run_id = %self.inner.run_id, "Disposing sync session");
            }
            state.disposed = true;
            state.flush_timer.cancel();
            state.retry_timer.cancel();
        }

        let watch = lock(&self.watch).take();
        if let Some(WatchHandle { watcher, consumer }) = watch {
            watcher.close().await;
            consumer.abort();
            let _ = consumer.await;
            info!(run_id = %self.inner.run_id, "Sync session stopped");
        }
    }

    /// Returns the run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn workspace_path(&self) -> &Path {
        &self.inner.workspace_path
    }

    /// Relative paths currently pending, in flush order.
    #[must_use]
    pub fn pending_paths(&self) -> Vec<String> {
        self.inner.state().pending.keys().cloned().collect()
    }

    /// The pending change for `relative_path`, if any.
    #[must_use]
    pub fn pending_change(&self, relative_path: &str) -> Option<PendingChange> {
        self.inner
            .state()
            .pending
            .get(&normalize_relative_path(relative_path))
            .cloned()
    }

    /// Number of pending changes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Returns true once [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state().disposed
    }

    /// Returns true while a flush is in progress.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.state().syncing
    }

    /// Returns true while the workspace watch is running.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        lock(&self.watch).is_some()
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("run_id", &self.inner.run_id)
            .field("workspace_path", &self.inner.workspace_path)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    /// Forward-slash path of `absolute_path` relative to the workspace.
    ///
    /// Returns `None` for the root itself and for paths outside it.
    fn relative_path(&self, absolute_path: &Path) -> Option<String> {
        let relative = absolute_path
            .strip_prefix(&self.workspace_path)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .get()
                    .and_then(|root| absolute_path.strip_prefix(root).ok())
            })?;

        let relative = normalize_relative_path(&relative.to_string_lossy());
        if relative.is_empty() || relative.starts_with("..") {
            return None;
        }
        Some(relative)
    }

    /// Predicate for the watch layer: never drops paths outside the root.
    ///
    /// Directories are matched with a trailing `/` so directory-only rules
    /// such as `node_modules/` prune them.
    fn watch_ignore_predicate(self: &Arc<Self>) -> IgnorePredicate {
        let inner = Arc::clone(self);
        Arc::new(move |path: &Path, is_dir: bool| match inner.relative_path(path) {
            Some(relative) if is_dir => inner.ignore.ignores(&format!("{relative}/")),
            Some(relative) => inner.ignore.ignores(&relative),
            None => false,
        })
    }

    fn record_change(self: &Arc<Self>, absolute_path: &Path, action: ChangeAction) {
        let mut state = self.state();
        if state.disposed {
            return;
        }

        let Some(relative_path) = self.relative_path(absolute_path) else {
            trace!(path = %absolute_path.display(), "Dropping event outside workspace");
            return;
        };

        if self.ignore.ignores(&relative_path) {
            trace!(path = %relative_path, "Dropping ignored path");
            return;
        }

        if state.recently_synced_from_local.is_suppressed(&relative_path) {
            debug!(
                run_id = %self.run_id,
                path = %relative_path,
                "Skipping echo of file synced from local"
            );
            return;
        }

        trace!(run_id = %self.run_id, path = %relative_path, ?action, "Recording change");

        // IndexMap::insert keeps the original position of an existing key
        state.pending.insert(
            relative_path.clone(),
            PendingChange {
                action,
                absolute_path: absolute_path.to_path_buf(),
                relative_path,
            },
        );

        self.schedule_flush(&mut state, self.options.debounce);
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut SessionState, delay: Duration) {
        let inner = Arc::clone(self);
        state.flush_timer.schedule(delay, async move {
            inner.flush().await;
        });
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut SessionState) {
        let inner = Arc::clone(self);
        state
            .retry_timer
            .schedule(self.options.retry_delay, async move {
                inner.flush().await;
            });
    }

    async fn flush(self: Arc<Self>) {
        let drained: Vec<PendingChange> = {
            let mut state = self.state();
            if state.disposed || state.syncing || state.pending.is_empty() {
                return;
            }
            state.syncing = true;
            std::mem::take(&mut state.pending).into_values().collect()
        };

        debug!(run_id = %self.run_id, changes = drained.len(), "Flushing pending changes");

        let result = self.emit_changes(&drained).await;

        let mut state = self.state();
        state.syncing = false;

        match result {
            Ok(emitted) => {
                if emitted > 0 {
                    info!(run_id = %self.run_id, files = emitted, "Synced changes");
                }
            }
            Err(e) => {
                error!(
                    run_id = %self.run_id,
                    changes = drained.len(),
                    error = %e,
                    "Failed to emit sync batch, will retry"
                );

                if !state.disposed {
                    // Changes recorded during the failed flush are newer and win
                    for change in drained {
                        if !state.pending.contains_key(&change.relative_path) {
                            state.pending.insert(change.relative_path.clone(), change);
                        }
                    }
                    self.schedule_retry(&mut state);
                }
            }
        }

        // Changes recorded mid-flush whose debounce fired while we were busy
        if !state.disposed
            && !state.pending.is_empty()
            && !state.flush_timer.is_pending()
            && !state.retry_timer.is_pending()
        {
            self.schedule_flush(&mut state, self.options.debounce);
        }
    }

    /// Encodes `changes` into batches and emits them in order.
    ///
    /// Returns the number of files emitted.
    async fn emit_changes(&self, changes: &[PendingChange]) -> Result<usize, EmitError> {
        let limits = &self.options.limits;
        let mut batch = Batch::new();
        let mut emitted = 0;

        for change in changes {
            let file = match change.action {
                ChangeAction::Delete => WorkerSyncFile::Delete {
                    relative_path: change.relative_path.clone(),
                },
                ChangeAction::Write => match self.encode_file(change).await {
                    Some(file) => file,
                    None => continue,
                },
            };

            if batch.needs_flush_before(&file, limits) {
                emitted += self.emit_batch(batch.take()).await?;
            }
            batch.push(file);
        }

        if !batch.is_empty() {
            emitted += self.emit_batch(batch.take()).await?;
        }

        Ok(emitted)
    }

    /// Reads a written file into its wire form.
    ///
    /// Returns `None` for files that vanished, are not regular files, are
    /// oversized, or cannot be read.
    async fn encode_file(&self, change: &PendingChange) -> Option<WorkerSyncFile> {
        let path = &change.absolute_path;

        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %change.relative_path, "File vanished before sync, skipping");
                return None;
            }
            Err(e) => {
                warn!(path = %change.relative_path, error = %e, "Failed to stat file, skipping");
                return None;
            }
        };

        if !meta.is_file() {
            trace!(path = %change.relative_path, "Not a regular file, skipping");
            return None;
        }

        if meta.len() > self.options.limits.max_single_file_bytes {
            warn!(
                path = %change.relative_path,
                size = meta.len(),
                max = self.options.limits.max_single_file_bytes,
                "Skipping oversized file"
            );
            return None;
        }

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %change.relative_path, error = %e, "Failed to read file, skipping");
                return None;
            }
        };

        Some(WorkerSyncFile::Write {
            relative_path: change.relative_path.clone(),
            content_base64: STANDARD.encode(&content),
            mode: format_mode(&meta),
        })
    }

    async fn emit_batch(&self, files: Vec<WorkerSyncFile>) -> Result<usize, EmitError> {
        if self.state().disposed {
            debug!(run_id = %self.run_id, files = files.len(), "Session disposed, dropping batch");
            return Ok(0);
        }

        let count = files.len();
        let batch = SyncBatch {
            run_id: self.run_id.clone(),
            files,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        debug!(run_id = %self.run_id, files = count, "Emitting sync batch");

        let emit = self.emitter.emit(batch);
        match self.options.emit_timeout {
            Some(limit) => tokio::time::timeout(limit, emit)
                .await
                .map_err(|_| EmitError::Timeout(limit))??,
            None => emit.await?,
        }

        Ok(count)
    }
}

/// POSIX permission bits as an octal string, e.g. `"644"`.
#[cfg(unix)]
fn format_mode(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode() & 0o777)
}

/// POSIX permission bits as an octal string, derived from the read-only flag.
#[cfg(not(unix))]
fn format_mode(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "444".to_string()
    } else {
        "644".to_string()
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

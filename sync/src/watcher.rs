//! Recursive workspace watcher.
//!
//! Watches a workspace directory tree and reports `add`, `change` and
//! `unlink` events as [`WatchEvent`]s on a channel.
//!
//! # Architecture
//!
//! The watcher uses the [`notify`] crate. The notify callback is kept
//! lightweight: it maps the raw event kind, applies the ignore predicate as a
//! first-pass filter, and sends the result through an unbounded internal
//! channel to a dedicated async task. The callback never blocks and never
//! drops events.
//!
//! That task forwards removals immediately. Creations and modifications go
//! through write stabilization first: the file's size and mtime are polled
//! until they stop changing, so partially written files are not reported. A
//! path is stabilized by at most one poller at a time; events arriving while
//! it runs mark the path dirty and trigger another round afterwards.
//!
//! A directory that appears (created, or renamed in with its contents) is
//! walked with [`ignore::WalkBuilder`] and every regular file under it is
//! reported as an `add`. When the backend reports an overflow the whole
//! workspace is walked the same way.
//!
//! On Linux the inotify backend needs one watch per directory, so instead of
//! a recursive watch each non-ignored directory is watched on its own and
//! ignored trees such as `node_modules` are never registered. Other backends
//! use a single recursive watch.
//!
//! # Example
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use workmirror_sync::watcher::{WatchEvent, WorkspaceWatcher, WriteStabilization};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!     let ignore = Arc::new(|path: &Path, _is_dir: bool| path.ends_with(".DS_Store"));
//!     let watcher = WorkspaceWatcher::new(
//!         PathBuf::from("/home/user/project"),
//!         ignore,
//!         Some(WriteStabilization::default()),
//!         tx,
//!     )
//!     .await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             WatchEvent::Add(path) => println!("Added: {:?}", path),
//!             WatchEvent::Change(path) => println!("Changed: {:?}", path),
//!             WatchEvent::Unlink(path) => println!("Removed: {:?}", path),
//!         }
//!     }
//!
//!     watcher.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use ignore::WalkBuilder;
use notify::{
    event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Whether the backend needs one watch per directory (inotify).
const PER_DIRECTORY_WATCHES: bool = cfg!(any(target_os = "linux", target_os = "android"));

/// Default time a file must stay unchanged before it is reported.
pub const DEFAULT_STABILITY_THRESHOLD_MS: u64 = 300;

/// Default interval between stabilization polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default upper bound on stabilization for files that never settle.
pub const DEFAULT_MAX_STABILIZATION_WAIT_MS: u64 = 10_000;

/// Events emitted by the workspace watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared (created, or renamed into place).
    Add(PathBuf),

    /// A file's content or permissions changed.
    Change(PathBuf),

    /// A file was removed (deleted, or renamed away).
    Unlink(PathBuf),
}

impl WatchEvent {
    /// Returns the absolute path this event refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Add(path) | Self::Change(path) | Self::Unlink(path) => path,
        }
    }
}

/// Internal events from the notify callback, processed by the async task.
#[derive(Debug)]
enum InternalEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    /// A directory was deleted. Its files are reported individually.
    RemovedDir(PathBuf),
    /// The backend lost events; the whole tree must be walked again.
    Rescan,
}

/// Errors that can occur during file watching operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// The watch directory does not exist or is inaccessible.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The blocking task registering the initial watches failed.
    #[error("watch setup task failed: {0}")]
    Setup(#[from] JoinError),
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// First-pass filter evaluated per path in the notify callback and while
/// walking directories.
///
/// Receives the path and whether it is a directory. Returns true for paths
/// whose events should be dropped; for directories this also keeps the
/// watcher from descending into them.
pub type IgnorePredicate = Arc<dyn Fn(&Path, bool) -> bool + Send + Sync>;

/// Settings for waiting until a written file stops changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStabilization {
    /// How long size and mtime must stay unchanged.
    pub stability_threshold: Duration,

    /// How often size and mtime are polled.
    pub poll_interval: Duration,

    /// Report the file anyway after this long, even if it keeps changing.
    pub max_wait: Duration,
}

impl Default for WriteStabilization {
    fn default() -> Self {
        Self {
            stability_threshold: Duration::from_millis(DEFAULT_STABILITY_THRESHOLD_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_wait: Duration::from_millis(DEFAULT_MAX_STABILIZATION_WAIT_MS),
        }
    }
}

/// Recursive watch over one workspace directory.
///
/// Dropping the watcher stops the notify subscription; [`close`](Self::close)
/// additionally waits for the processing task to stop.
#[derive(Debug)]
pub struct WorkspaceWatcher {
    /// The notify watcher and the directories registered with it.
    registry: Arc<Mutex<WatchRegistry>>,

    /// Task turning internal events into [`WatchEvent`]s.
    task: JoinHandle<()>,

    /// The root directory being watched.
    root: PathBuf,
}

impl WorkspaceWatcher {
    /// Starts watching `root` and everything below it.
    ///
    /// # Arguments
    ///
    /// * `root` - Workspace directory to watch
    /// * `ignore` - First-pass filter; paths for which it returns true are dropped
    /// * `stabilization` - Write stabilization settings, `None` to report immediately
    /// * `event_sender` - Channel for emitting [`WatchEvent`]s
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or the file system
    /// watcher cannot be initialized.
    pub async fn new(
        root: PathBuf,
        ignore: IgnorePredicate,
        stabilization: Option<WriteStabilization>,
        event_sender: mpsc::Sender<WatchEvent>,
    ) -> Result<Self> {
        let is_dir = tokio::fs::metadata(&root)
            .await
            .is_ok_and(|meta| meta.is_dir());
        if !is_dir {
            return Err(WatcherError::DirectoryNotFound(root));
        }

        // Bridges the sync notify callback to the async processing task.
        // Events arriving during setup wait here until the task starts.
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<InternalEvent>();

        let watcher = create_watcher(internal_tx, Arc::clone(&ignore))?;
        let registry = Arc::new(Mutex::new(WatchRegistry::new(watcher)));

        // Registering watches walks the tree, so it runs off the async workers
        let setup = {
            let registry = Arc::clone(&registry);
            let root = root.clone();
            let ignore = Arc::clone(&ignore);
            tokio::task::spawn_blocking(move || lock(&registry).watch_root(&root, &ignore))
        };
        setup.await??;

        let watched_dirs = lock(&registry).dirs.len();
        info!(
            root = %root.display(),
            watched_dirs,
            "Started workspace watch"
        );

        let processor = EventProcessor {
            root: root.clone(),
            ignore,
            stabilization,
            registry: Arc::clone(&registry),
            sender: event_sender,
            in_flight: HashMap::new(),
            pollers: JoinSet::new(),
        };
        let task = tokio::spawn(processor.run(internal_rx));

        Ok(Self {
            registry,
            task,
            root,
        })
    }

    /// Returns the directory being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops watching and waits for the processing task to end.
    ///
    /// Stabilizations still in progress are abandoned.
    pub async fn close(self) {
        let Self {
            registry,
            task,
            root,
        } = self;

        task.abort();
        // A cancelled JoinError is the expected outcome here
        let _ = task.await;
        drop(registry);

        debug!(root = %root.display(), "Closed workspace watch");
    }

    /// Directories registered individually with the backend.
    #[cfg(test)]
    fn watched_dirs(&self) -> HashSet<PathBuf> {
        lock(&self.registry).dirs.clone()
    }
}

/// The notify watcher together with the directories it watches.
#[derive(Debug)]
struct WatchRegistry {
    watcher: RecommendedWatcher,

    /// Directories watched non-recursively. Empty with a recursive watch.
    dirs: HashSet<PathBuf>,
}

impl WatchRegistry {
    fn new(watcher: RecommendedWatcher) -> Self {
        Self {
            watcher,
            dirs: HashSet::new(),
        }
    }

    /// Registers the watch on the workspace root and, with per-directory
    /// watches, on every non-ignored directory below it.
    fn watch_root(&mut self, root: &Path, ignore: &IgnorePredicate) -> notify::Result<()> {
        if !PER_DIRECTORY_WATCHES {
            self.watcher.watch(root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "Started recursive file watch");
            return Ok(());
        }

        self.watcher.watch(root, RecursiveMode::NonRecursive)?;
        self.dirs.insert(root.to_path_buf());
        self.add_tree(root, ignore, false);

        debug!(
            root = %root.display(),
            dirs = self.dirs.len(),
            "Started per-directory file watch"
        );
        Ok(())
    }

    /// Walks `dir`, watching each non-ignored directory found.
    ///
    /// Returns the regular files below `dir` when `collect_files` is set.
    fn add_tree(&mut self, dir: &Path, ignore: &IgnorePredicate, collect_files: bool) -> Vec<PathBuf> {
        let filter = Arc::clone(ignore);
        let walker = WalkBuilder::new(dir)
            // Only the workspace ignore rules apply, not git or hidden-file rules
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                entry.depth() == 0 || !filter(entry.path(), is_dir)
            })
            .build();

        let mut files = Vec::new();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                self.watch_dir(entry.path());
            } else if file_type.is_file() && collect_files {
                files.push(entry.into_path());
            }
        }

        files
    }

    fn watch_dir(&mut self, dir: &Path) {
        if !PER_DIRECTORY_WATCHES || self.dirs.contains(dir) {
            return;
        }

        match self.watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                self.dirs.insert(dir.to_path_buf());
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
        }
    }

    /// Drops the watches on `path` and every directory below it.
    fn forget(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();

        for dir in gone {
            self.dirs.remove(&dir);
            // The kernel usually removed the watch along with the directory
            if let Err(e) = self.watcher.unwatch(&dir) {
                trace!(dir = %dir.display(), error = %e, "Watch already gone");
            }
        }
    }
}

fn lock(registry: &Mutex<WatchRegistry>) -> MutexGuard<'_, WatchRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates the underlying notify watcher with a lightweight callback.
fn create_watcher(
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    ignore: IgnorePredicate,
) -> Result<RecommendedWatcher> {
    let watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            handle_notify_event(res, &internal_tx, ignore.as_ref());
        },
        Config::default(),
    )?;

    Ok(watcher)
}

/// Handles events from the notify crate.
///
/// Only maps and filters; all file I/O beyond a directory check happens in
/// the async task.
fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    internal_tx: &mpsc::UnboundedSender<InternalEvent>,
    ignore: &(dyn Fn(&Path, bool) -> bool + Send + Sync),
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    if event.need_rescan() {
        warn!("File watcher dropped events, rescanning workspace");
        if internal_tx.send(InternalEvent::Rescan).is_err() {
            trace!("Event processor gone");
        }
    }

    for internal_event in map_event(&event) {
        let (path, is_dir) = match &internal_event {
            InternalEvent::Created(p) => (p.as_path(), p.is_dir()),
            InternalEvent::Modified(p) | InternalEvent::Removed(p) => (p.as_path(), false),
            InternalEvent::RemovedDir(p) => (p.as_path(), true),
            InternalEvent::Rescan => continue,
        };

        if ignore(path, is_dir) {
            trace!(path = %path.display(), "Ignoring path");
            continue;
        }

        if internal_tx.send(internal_event).is_err() {
            trace!("Event processor gone");
            return;
        }
    }
}

/// Maps a notify event onto zero or more internal events.
fn map_event(event: &Event) -> Vec<InternalEvent> {
    let paths = &event.paths;

    match event.kind {
        EventKind::Create(
            CreateKind::File | CreateKind::Folder | CreateKind::Any | CreateKind::Other,
        ) => paths.iter().cloned().map(InternalEvent::Created).collect(),
        EventKind::Modify(
            ModifyKind::Data(_)
            | ModifyKind::Any
            | ModifyKind::Other
            | ModifyKind::Metadata(
                MetadataKind::Any | MetadataKind::Permissions | MetadataKind::WriteTime,
            ),
        ) => paths.iter().cloned().map(InternalEvent::Modified).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(InternalEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(InternalEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => vec![
            InternalEvent::Removed(paths[0].clone()),
            InternalEvent::Created(paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|path| {
                // Backends that cannot tell the rename direction
                if path.exists() {
                    InternalEvent::Created(path.clone())
                } else {
                    InternalEvent::Removed(path.clone())
                }
            })
            .collect(),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any | RemoveKind::Other) => {
            paths.iter().cloned().map(InternalEvent::Removed).collect()
        }
        EventKind::Remove(RemoveKind::Folder) => {
            paths.iter().cloned().map(InternalEvent::RemovedDir).collect()
        }
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    }
}

/// State of the async task that processes internal events.
struct EventProcessor {
    root: PathBuf,
    ignore: IgnorePredicate,
    stabilization: Option<WriteStabilization>,
    registry: Arc<Mutex<WatchRegistry>>,
    sender: mpsc::Sender<WatchEvent>,

    /// Paths with a running poller, and whether they changed again meanwhile
    in_flight: HashMap<PathBuf, bool>,
    pollers: JoinSet<(WatchEvent, bool)>,
}

impl EventProcessor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<InternalEvent>) {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }

                Some(joined) = self.pollers.join_next(), if !self.pollers.is_empty() => {
                    match joined {
                        Ok((watch_event, exists)) => self.finish_stabilization(watch_event, exists).await,
                        Err(e) => warn!(error = %e, "Stabilization task failed"),
                    }
                }
            }
        }

        debug!("Internal event processor shutting down");
    }

    async fn handle(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Removed(path) => {
                let removed = path.clone();
                self.with_registry(move |registry| registry.forget(&removed))
                    .await;
                self.forward(WatchEvent::Unlink(path)).await;
            }
            InternalEvent::RemovedDir(path) => {
                self.with_registry(move |registry| registry.forget(&path))
                    .await;
            }
            InternalEvent::Created(path) => {
                let is_dir = tokio::fs::symlink_metadata(&path)
                    .await
                    .is_ok_and(|meta| meta.is_dir());
                if is_dir {
                    self.scan(path).await;
                } else {
                    self.submit(WatchEvent::Add(path)).await;
                }
            }
            InternalEvent::Modified(path) => self.submit(WatchEvent::Change(path)).await,
            InternalEvent::Rescan => self.scan(self.root.clone()).await,
        }
    }

    /// Watches a new directory tree and reports every file in it as added.
    async fn scan(&mut self, dir: PathBuf) {
        let ignore = Arc::clone(&self.ignore);
        let walked = dir.clone();
        let files = self
            .with_registry(move |registry| registry.add_tree(&walked, &ignore, true))
            .await
            .unwrap_or_default();

        debug!(dir = %dir.display(), files = files.len(), "Scanned directory");

        for file in files {
            self.submit(WatchEvent::Add(file)).await;
        }
    }

    /// Runs `f` against the registry on the blocking pool.
    async fn with_registry<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WatchRegistry) -> T + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        match tokio::task::spawn_blocking(move || f(&mut lock(&registry))).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Watch registry task failed");
                None
            }
        }
    }

    /// Forwards the event, after write stabilization when enabled.
    async fn submit(&mut self, event: WatchEvent) {
        let Some(config) = self.stabilization else {
            self.forward(event).await;
            return;
        };

        if let Some(dirty) = self.in_flight.get_mut(event.path()) {
            *dirty = true;
            return;
        }

        self.in_flight.insert(event.path().to_path_buf(), false);
        self.pollers.spawn(stabilize(event, config));
    }

    async fn finish_stabilization(&mut self, event: WatchEvent, exists: bool) {
        let dirty = self.in_flight.remove(event.path()).unwrap_or(false);

        if exists {
            self.forward(event.clone()).await;
        } else {
            trace!(path = %event.path().display(), "File vanished during stabilization");
        }

        if dirty {
            if let Some(config) = self.stabilization {
                let path = event.path().to_path_buf();
                self.in_flight.insert(path.clone(), false);
                self.pollers.spawn(stabilize(WatchEvent::Change(path), config));
            }
        }
    }

    /// Sends an event to the consumer, logging if it is gone.
    async fn forward(&self, event: WatchEvent) {
        if let Err(e) = self.sender.send(event).await {
            debug!(error = %e, "Watch event consumer closed");
        }
    }
}

/// Waits until the event's file stops changing.
///
/// Returns the event and whether the file still exists.
async fn stabilize(event: WatchEvent, config: WriteStabilization) -> (WatchEvent, bool) {
    let exists = await_write_finish(event.path(), &config).await;
    (event, exists)
}

/// Polls size and mtime until they are unchanged for the stability threshold.
///
/// Returns false if the file disappears while waiting.
async fn await_write_finish(path: &Path, config: &WriteStabilization) -> bool {
    let started = Instant::now();

    let Some(mut last) = snapshot(path).await else {
        return false;
    };
    let mut stable_since = Instant::now();

    loop {
        tokio::time::sleep(config.poll_interval).await;

        let Some(current) = snapshot(path).await else {
            return false;
        };

        if current != last {
            last = current;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= config.stability_threshold {
            return true;
        }

        if started.elapsed() >= config.max_wait {
            debug!(path = %path.display(), "File still changing, reporting anyway");
            return true;
        }
    }
}

/// Size and modification time of a path, or `None` if it cannot be read.
async fn snapshot(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.len(), meta.modified().ok()))
}

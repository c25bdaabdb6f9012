//! Workmirror sync - one-directional workspace file sync.
//!
//! This crate watches workspace directories and forwards file changes to a
//! remote side in ordered, size-bounded batches.
//!
//! # Overview
//!
//! A [`SyncManager`] holds one [`SyncSession`] per run. Each session watches
//! its workspace recursively, drops paths matched by the workspace's ignore
//! rules, coalesces changes per path and flushes them after a quiet period.
//! Written files are sent base64-encoded with their permission bits; deleted
//! files are sent as delete entries. Failed deliveries are retried.
//!
//! # Echo suppression
//!
//! Files written into the workspace by the opposite sync direction must not
//! be sent back. Call [`SyncManager::mark_synced_from_local`] immediately
//! before such a write; events for those paths are ignored for a short TTL.
//!
//! # Modules
//!
//! - [`types`]: Wire types and pending change records
//! - [`ignore_rules`]: Gitignore-style path filtering
//! - [`watcher`]: Recursive workspace watcher with write stabilization
//! - [`echo`]: Time-limited echo suppression
//! - [`batch`]: Size-bounded batch accumulation
//! - [`emitter`]: Batch delivery (HTTP, channel, stdout)
//! - [`session`]: Per-workspace sync session
//! - [`manager`]: Session registry keyed by run id
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for sync operations
//! - [`utils`]: Shared utilities (debouncing)

pub mod batch;
pub mod config;
pub mod echo;
pub mod emitter;
pub mod error;
pub mod ignore_rules;
pub mod manager;
pub mod session;
pub mod types;
pub mod utils;
pub mod watcher;

pub use batch::{BatchLimits, MAX_BATCH_BYTES, MAX_BATCH_FILES, MAX_SINGLE_FILE_BYTES};
pub use config::{Config, ConfigError};
pub use emitter::{emit_fn, ChannelEmitter, EmitError, Emitter, HttpEmitter, StdoutEmitter};
pub use error::{Result, SyncError};
pub use ignore_rules::{IgnoreError, IgnoreMatcher, DEFAULT_IGNORE_RULES};
pub use manager::SyncManager;
pub use session::{SyncOptions, SyncSession};
pub use types::{ChangeAction, PendingChange, SyncBatch, WorkerSyncFile};
pub use watcher::{WatchEvent, WatcherError, WorkspaceWatcher, WriteStabilization};

//! Size-bounded batch accumulation.
//!
//! A flush walks its drained entries in order and pushes them into a
//! [`Batch`]. Before each push the flush asks whether the batch must be
//! emitted first, so every emitted batch stays within [`BatchLimits`].

use crate::types::WorkerSyncFile;

/// Maximum number of files in one emitted batch.
pub const MAX_BATCH_FILES: usize = 200;

/// Maximum encoded content bytes in one emitted batch (6 MiB).
pub const MAX_BATCH_BYTES: usize = 6 * 1024 * 1024;

/// Files larger than this are never synced (50 MiB).
pub const MAX_SINGLE_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Bounds applied while building batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum number of files per batch.
    pub max_files: usize,

    /// Maximum encoded content bytes per batch. A single file larger than
    /// this still travels, alone in its batch.
    pub max_bytes: usize,

    /// Files whose on-disk size exceeds this are skipped entirely.
    pub max_single_file_bytes: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_files: MAX_BATCH_FILES,
            max_bytes: MAX_BATCH_BYTES,
            max_single_file_bytes: MAX_SINGLE_FILE_BYTES,
        }
    }
}

/// Files accumulated for the next emission.
#[derive(Debug, Default)]
pub struct Batch {
    files: Vec<WorkerSyncFile>,
    bytes: usize,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the batch has reached either limit.
    #[must_use]
    pub fn is_full(&self, limits: &BatchLimits) -> bool {
        self.files.len() >= limits.max_files || self.bytes >= limits.max_bytes
    }

    /// Returns true if adding `file` must be preceded by emitting this batch.
    ///
    /// An empty batch always accepts the next file.
    #[must_use]
    pub fn needs_flush_before(&self, file: &WorkerSyncFile, limits: &BatchLimits) -> bool {
        if self.files.is_empty() {
            return false;
        }
        self.is_full(limits) || self.bytes + file.content_len() > limits.max_bytes
    }

    /// Appends a file.
    pub fn push(&mut self, file: WorkerSyncFile) {
        self.bytes += file.content_len();
        self.files.push(file);
    }

    /// Takes the accumulated files, leaving the batch empty.
    pub fn take(&mut self) -> Vec<WorkerSyncFile> {
        self.bytes = 0;
        std::mem::take(&mut self.files)
    }

    /// Number of files in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the batch holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Encoded content bytes in the batch.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

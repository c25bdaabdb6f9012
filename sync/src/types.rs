//! Change and wire types for workspace synchronization.
//!
//! [`PendingChange`] is the in-memory record a session keeps per path until
//! the next flush. [`WorkerSyncFile`] and [`SyncBatch`] are the wire schema
//! handed to an [`Emitter`](crate::emitter::Emitter). Wire types serialize to
//! camelCase JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What happened to a path, as far as the remote side is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// The file was created or its content/mode changed.
    Write,
    /// The file was removed.
    Delete,
}

/// A change waiting in a session's pending map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// The latest action observed for the path.
    pub action: ChangeAction,

    /// Absolute path on the local filesystem, used to read content at flush time.
    pub absolute_path: PathBuf,

    /// Forward-slash path relative to the workspace root. Key of the pending map.
    pub relative_path: String,
}

/// A single file entry in an emitted batch.
///
/// Uses serde's internally tagged representation so that delete entries carry
/// no `contentBase64` or `mode` keys at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerSyncFile {
    /// Full content of a written file.
    Write {
        #[serde(rename = "relativePath")]
        relative_path: String,
        #[serde(rename = "contentBase64")]
        content_base64: String,
        /// POSIX permission bits as an octal string, e.g. `"644"`.
        mode: String,
    },
    /// A removed file.
    Delete {
        #[serde(rename = "relativePath")]
        relative_path: String,
    },
}

impl WorkerSyncFile {
    /// Returns the workspace-relative path of this entry.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        match self {
            Self::Write { relative_path, .. } | Self::Delete { relative_path } => relative_path,
        }
    }

    /// Returns the action this entry represents.
    #[must_use]
    pub fn action(&self) -> ChangeAction {
        match self {
            Self::Write { .. } => ChangeAction::Write,
            Self::Delete { .. } => ChangeAction::Delete,
        }
    }

    /// Number of content bytes this entry contributes to a batch.
    ///
    /// Counts the encoded length, since that is what travels on the wire.
    #[must_use]
    pub fn content_len(&self) -> usize {
        match self {
            Self::Write { content_base64, .. } => content_base64.len(),
            Self::Delete { .. } => 0,
        }
    }
}

/// One emission: the files of a batch plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    /// Run identifier of the session that produced the batch.
    pub run_id: String,

    /// Files in pending-map order.
    pub files: Vec<WorkerSyncFile>,

    /// Emission time in Unix epoch milliseconds.
    pub timestamp: i64,
}

/// Converts a relative path to the forward-slash form used as map key and on the wire.
#[must_use]
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
}

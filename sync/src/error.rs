//! Error types for workspace sync.
//!
//! Each concern has its own error enum next to the code that produces it.
//! [`SyncError`] wraps the ones that can stop a sync from starting, for
//! callers such as
//! [`SyncManager::start_sync`](crate::manager::SyncManager::start_sync).
//! Emit failures never surface here: a session retries them itself.

use thiserror::Error;

use crate::ignore_rules::IgnoreError;
use crate::watcher::WatcherError;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The workspace watch could not be established.
    #[error("file watch error: {0}")]
    Watcher(#[from] WatcherError),

    /// Ignore rules could not be compiled.
    #[error("ignore rules error: {0}")]
    Ignore(#[from] IgnoreError),
}

/// A specialized `Result` type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sync_error_watcher_conversion() {
        let watcher_err = WatcherError::DirectoryNotFound(PathBuf::from("/missing"));
        let err: SyncError = watcher_err.into();
        assert!(matches!(err, SyncError::Watcher(_)));
        assert_eq!(err.to_string(), "file watch error: watch directory does not exist: /missing");
    }

    #[test]
    fn sync_error_ignore_conversion() {
        let ignore_err = IgnoreError::Build(ignore::Error::Glob {
            glob: Some("[unclosed".to_string()),
            err: "unclosed character class".to_string(),
        });
        let err: SyncError = ignore_err.into();
        assert!(matches!(err, SyncError::Ignore(_)));
        assert!(err.to_string().starts_with("ignore rules error: failed to build ignore rules"));
    }

    #[test]
    fn result_type_alias_works() {
        fn example_function() -> Result<i32> {
            Ok(42)
        }

        fn example_error_function() -> Result<i32> {
            Err(SyncError::Watcher(WatcherError::DirectoryNotFound(PathBuf::from("/w"))))
        }

        assert!(example_function().is_ok());
        assert!(example_error_function().is_err());
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error;

        let err: SyncError = WatcherError::DirectoryNotFound(PathBuf::from("/w")).into();

        // thiserror forwards #[from] fields as the source
        let source = err.source().expect("watcher error as source");
        assert_eq!(source.to_string(), "watch directory does not exist: /w");
    }
}

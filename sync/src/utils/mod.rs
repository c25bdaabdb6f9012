//! Utility modules for workspace sync.
//!
//! # Modules
//!
//! - [`debounce`]: Cancellable delayed tasks for debounce and retry timers

pub mod debounce;

pub use debounce::{Debouncer, DEFAULT_DEBOUNCE_MS};

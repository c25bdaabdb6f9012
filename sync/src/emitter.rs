//! Batch delivery to the opposite side.
//!
//! A session hands every finished batch to an [`Emitter`]. The session owns
//! retrying: an emitter makes one delivery attempt per call and reports
//! failure through [`EmitError`], after which the session re-queues the
//! changes and tries again later.
//!
//! Provided emitters:
//!
//! - [`HttpEmitter`]: POSTs the batch as JSON to a server
//! - [`ChannelEmitter`]: forwards batches into a Tokio channel for an embedding host
//! - [`StdoutEmitter`]: writes one JSON line per batch to stdout
//! - [`FnEmitter`]: adapts an async closure, see [`emit_fn`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use workmirror_sync::emitter::{Emitter, HttpEmitter};
//!
//! # fn example() -> Result<(), workmirror_sync::emitter::EmitError> {
//! let emitter: Arc<dyn Emitter> = Arc::new(HttpEmitter::new(
//!     "https://mirror.example.com",
//!     Some("secret-token".to_string()),
//! )?);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::SyncBatch;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Path appended to the server URL for batch delivery.
const SYNC_FILES_PATH: &str = "/sync-files";

/// Fallback when a 429 response has no usable Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 2;

/// Errors that can occur while delivering a batch.
#[derive(Error, Debug)]
pub enum EmitError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Authentication failed (401).
    #[error("authentication failed: invalid or missing token")]
    AuthFailed,

    /// Rate limited (429).
    #[error("rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// The receiving side of a channel emitter is gone.
    #[error("emit channel closed")]
    ChannelClosed,

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing the batch failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid header value (auth token contains invalid characters).
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// The emitter did not finish within the session's emit timeout.
    #[error("emit timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Any other transport failure reported by a host-supplied emitter.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Delivers finished batches to the remote transport.
pub trait Emitter: Send + Sync {
    /// Makes one attempt to deliver `batch`.
    fn emit(&self, batch: SyncBatch) -> BoxFuture<'_, Result<(), EmitError>>;
}

/// Emitter that POSTs each batch as JSON to `{server_url}/sync-files`.
#[derive(Debug, Clone)]
pub struct HttpEmitter {
    client: Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpEmitter {
    /// Creates an emitter for the given server.
    ///
    /// # Arguments
    ///
    /// * `server_url` - Base URL of the receiving server
    /// * `auth_token` - Optional bearer token sent with every request
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(server_url: &str, auth_token: Option<String>) -> Result<Self, EmitError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{SYNC_FILES_PATH}", server_url.trim_end_matches('/')),
            auth_token,
        })
    }

    /// URL batches are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, batch: SyncBatch) -> Result<(), EmitError> {
        let body = serde_json::to_vec(&batch)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.auth_token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }

        debug!(
            url = %self.endpoint,
            run_id = %batch.run_id,
            files = batch.files.len(),
            bytes = body.len(),
            "Posting sync batch"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        match status {
            _ if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(EmitError::AuthFailed),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = parse_retry_after(&response);
                warn!(retry_after_secs, "Rate limited by server");
                Err(EmitError::RateLimited { retry_after_secs })
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                Err(EmitError::ServerError {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

impl Emitter for HttpEmitter {
    fn emit(&self, batch: SyncBatch) -> BoxFuture<'_, Result<(), EmitError>> {
        self.post(batch).boxed()
    }
}

/// Parses the Retry-After header from a 429 response.
fn parse_retry_after(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Emitter that forwards batches into a channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::Sender<SyncBatch>,
}

impl ChannelEmitter {
    /// Creates an emitter sending into `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<SyncBatch>) -> Self {
        Self { tx }
    }
}

impl Emitter for ChannelEmitter {
    fn emit(&self, batch: SyncBatch) -> BoxFuture<'_, Result<(), EmitError>> {
        async move {
            self.tx
                .send(batch)
                .await
                .map_err(|_| EmitError::ChannelClosed)
        }
        .boxed()
    }
}

/// Emitter that writes each batch as a single JSON line to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutEmitter;

impl Emitter for StdoutEmitter {
    fn emit(&self, batch: SyncBatch) -> BoxFuture<'_, Result<(), EmitError>> {
        async move {
            let mut line = serde_json::to_vec(&batch)?;
            line.push(b'\n');

            let mut stdout = tokio::io::stdout();
            stdout.write_all(&line).await?;
            stdout.flush().await?;
            Ok(())
        }
        .boxed()
    }
}

/// Emitter backed by an async closure.
pub struct FnEmitter<F> {
    f: F,
}

/// Wraps an async closure as an [`Emitter`].
///
/// # Example
///
/// ```
/// use workmirror_sync::emitter::{emit_fn, EmitError};
/// use workmirror_sync::types::SyncBatch;
///
/// let emitter = emit_fn(|batch: SyncBatch| async move {
///     println!("{} files for {}", batch.files.len(), batch.run_id);
///     Ok::<(), EmitError>(())
/// });
/// ```
pub fn emit_fn<F, Fut>(f: F) -> FnEmitter<F>
where
    F: Fn(SyncBatch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EmitError>> + Send + 'static,
{
    FnEmitter { f }
}

impl<F, Fut> Emitter for FnEmitter<F>
where
    F: Fn(SyncBatch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EmitError>> + Send + 'static,
{
    fn emit(&self, batch: SyncBatch) -> BoxFuture<'_, Result<(), EmitError>> {
        (self.f)(batch).boxed()
    }
}

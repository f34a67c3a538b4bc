//! Uniform byte stream abstraction.
//!
//! Every transport hands the rest of the crate a [`ByteStream`]; nothing
//! downstream knows which HTTP stack produced it. This module also holds the
//! two stream decorators the client applies: an idle timeout that turns a
//! stalled read into an explicit error, and a logging tee that copies bytes
//! to a capped side buffer without touching the primary stream.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::ProviderError;

/// Async stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Chunks buffered between the primary stream and the logging branch.
const TEE_CHANNEL_CAPACITY: usize = 256;

/// Wrap a reqwest body.
pub fn from_reqwest(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(ProviderError::from)))
}

/// A stream over one in-memory body.
pub fn from_bytes(body: impl Into<Bytes>) -> ByteStream {
    let body: Bytes = body.into();
    Box::pin(futures::stream::once(async move { Ok(body) }))
}

/// Read the whole body, keeping at most `limit` bytes.
pub async fn collect_body(mut body: ByteStream, limit: usize) -> Result<Vec<u8>, ProviderError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let room = limit.saturating_sub(out.len());
        out.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Idle timeout
// ─────────────────────────────────────────────────────────────────────────────

/// Fail with [`ProviderError::IdleTimeout`] when no chunk arrives within `idle`.
///
/// The stream ends after yielding the timeout error.
pub fn with_idle_timeout(body: ByteStream, idle: Duration) -> ByteStream {
    let stream = futures::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(item)) => Some((item, Some(body))),
            Ok(None) => None,
            Err(_) => Some((Err(ProviderError::IdleTimeout(idle)), None)),
        }
    });
    Box::pin(stream)
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging tee
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes seen by the logging branch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedBody {
    /// First bytes of the body, up to the cap.
    pub bytes: Vec<u8>,
    /// Bytes observed in total.
    pub total_bytes: usize,
}

impl CapturedBody {
    /// Whether the capture stopped short of the full body.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total_bytes > self.bytes.len()
    }

    /// Captured bytes as (lossy) text.
    #[must_use]
    pub fn preview(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Split `body` into the primary stream and a capture future.
///
/// The primary side forwards every item unchanged. Copies are offered to the
/// capture side with `try_send`; when the side channel is full or gone the
/// copy is dropped, so the primary never waits on logging.
pub fn tee(
    body: ByteStream,
    cap: usize,
) -> (ByteStream, impl Future<Output = CapturedBody> + Send + 'static) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(TEE_CHANNEL_CAPACITY);

    let primary = body.map(move |item| {
        if let Ok(chunk) = &item {
            let _ = tx.try_send(chunk.clone());
        }
        item
    });

    let capture = async move {
        let mut captured = CapturedBody::default();
        while let Some(chunk) = rx.recv().await {
            captured.total_bytes += chunk.len();
            let room = cap.saturating_sub(captured.bytes.len());
            captured
                .bytes
                .extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        captured
    };

    (Box::pin(primary), capture)
}

/// Tee `body` and log the captured preview at `debug` once the body ends.
pub fn tee_for_logging(body: ByteStream, cap: usize, label: String) -> ByteStream {
    let (primary, capture) = tee(body, cap);
    drop(tokio::spawn(async move {
        let captured = capture.await;
        debug!(
            upstream = %label,
            total_bytes = captured.total_bytes,
            truncated = captured.truncated(),
            preview = %captured.preview(),
            "upstream response body"
        );
    }));
    primary
}

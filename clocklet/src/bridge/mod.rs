//! Correlation bridge between the host and the worker subprocess.
//!
//! Every outbound call gets a fresh id from an incrementing counter and a
//! pending-table entry holding its completion handle; the read loop matches
//! worker reply lines back to entries purely by id. Exactly one of three
//! things settles an entry: the matching response, the per-call deadline,
//! or worker termination. `DashMap::remove` is the single settlement point,
//! so an entry can never be settled twice.
//!
//! # Architecture
//!
//! - **protocol**: wire message types
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{HANDSHAKE_METHOD, RemoteFault, WireRequest, WireResponse};

/// How long a single call may wait for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure modes of a single bridge call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// No worker is attached, or the handshake has not completed yet.
    #[error("worker is not initialized")]
    NotInitialized,

    /// No matching response arrived within the call deadline. The worker
    /// is assumed alive; only this call is affected.
    #[error("request timed out: {method}")]
    RequestTimeout { method: String },

    /// The worker reported a business-level error for this call.
    #[error("worker error: {0}")]
    Remote(RemoteFault),

    /// The worker process exited while this call was pending.
    #[error("worker terminated")]
    WorkerTerminated,

    /// Writing the request to the worker's stdin failed.
    #[error("failed to send request: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub call_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

type CallOutcome = Result<serde_json::Value, CallError>;
type BridgeWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonLineCodec<WireRequest>>;

struct PendingCall {
    method: String,
    settle: oneshot::Sender<CallOutcome>,
}

/// Correlated request/response channel to the worker process.
///
/// One instance per application lifetime; the id counter never resets, so
/// re-attaching after a crash cannot collide with entries from an earlier
/// worker generation.
pub struct Bridge {
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<BridgeWriter>>,
    accepting: AtomicBool,
    call_timeout: Duration,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(None),
            accepting: AtomicBool::new(false),
            call_timeout: config.call_timeout,
        }
    }

    /// Attach the worker's stdin. Calls stay rejected until the handshake
    /// has completed and [`Bridge::mark_ready`] was called.
    pub async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let framed = FramedWrite::new(
            Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
            JsonLineCodec::new(),
        );
        *self.writer.lock().await = Some(framed);
    }

    /// Spawn the response read loop over the worker's stdout.
    ///
    /// When the stream ends (worker exit or terminate), the bridge detaches
    /// itself and every still-pending call is rejected with
    /// [`CallError::WorkerTerminated`].
    pub fn spawn_read_loop<R>(self: &Arc<Self>, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, JsonLineCodec::<WireResponse>::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(response) => bridge.settle(response),
                    Err(err) => {
                        tracing::error!(error = %err, "Worker output stream error");
                        break;
                    }
                }
            }
            tracing::debug!("Worker output stream closed");
            bridge.detach().await;
        })
    }

    /// Open the bridge for calls. Only the agent flips this, after the
    /// handshake resolved.
    pub(crate) fn mark_ready(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Drop the attached worker and reject everything in flight.
    /// Idempotent; also invoked by the read loop on stream end.
    pub async fn detach(&self) {
        self.accepting.store(false, Ordering::Release);
        *self.writer.lock().await = None;
        self.fail_all(CallError::WorkerTerminated);
    }

    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Issue a correlated call and wait for its outcome.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> CallOutcome {
        if !self.is_ready() {
            return Err(CallError::NotInitialized);
        }
        self.dispatch(method, params).await
    }

    /// The distinguished first call, dispatched while the worker is still
    /// starting. Everything else must go through [`Bridge::call`].
    pub(crate) async fn handshake(&self) -> CallOutcome {
        self.dispatch(HANDSHAKE_METHOD, serde_json::json!({})).await
    }

    async fn dispatch(&self, method: &str, params: serde_json::Value) -> CallOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                settle: tx,
            },
        );

        let request = WireRequest {
            method: method.to_string(),
            params,
            id,
        };
        if let Err(err) = self.send(request).await {
            self.pending.remove(&id);
            return Err(err);
        }
        tracing::trace!(method, id, "Dispatched call");

        let deadline = tokio::time::sleep(self.call_timeout);
        tokio::pin!(deadline);
        tokio::select! {
            settled = &mut rx => settled.unwrap_or(Err(CallError::WorkerTerminated)),
            _ = &mut deadline => {
                if self.pending.remove(&id).is_some() {
                    tracing::warn!(method, id, "Call timed out; a late response will be ignored");
                    Err(CallError::RequestTimeout {
                        method: method.to_string(),
                    })
                } else {
                    // The response won the race against the deadline and is
                    // already on its way through the channel.
                    rx.await.unwrap_or(Err(CallError::WorkerTerminated))
                }
            }
        }
    }

    async fn send(&self, request: WireRequest) -> Result<(), CallError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CallError::NotInitialized)?;
        writer
            .send(request)
            .await
            .map_err(|err| CallError::Transport(err.to_string()))
    }

    fn settle(&self, response: WireResponse) {
        let Some(id) = response.id else {
            tracing::debug!("Dropping worker reply without an id");
            return;
        };
        let Some((_, entry)) = self.pending.remove(&id) else {
            tracing::debug!(id, "Dropping worker reply with no pending call");
            return;
        };
        let outcome = response.into_outcome().map_err(CallError::Remote);
        if entry.settle.send(outcome).is_err() {
            tracing::trace!(id, method = %entry.method, "Caller went away before settlement");
        }
    }

    /// Reject every pending call with the given error.
    pub(crate) fn fail_all(&self, error: CallError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                tracing::debug!(id, method = %entry.method, "Rejecting pending call");
                let _ = entry.settle.send(Err(error.clone()));
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

//! Worker - the isolated side of the channel.
//!
//! The worker owns nothing but its port. Everything it touches arrives in an
//! envelope: copied values in the frame, region handles and owned buffers in
//! the transfer list. The coordinator side is in coordinator.rs.
//!
//! Requests are handled one at a time, in channel order. Each produces exactly
//! one response; frames that cannot be decoded are answered with
//! `UNSUPPORTED_REQUEST` rather than dropped.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bridge::channel::{Envelope, Port, TransferList};
use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use crate::bridge::protocol::{Mode, Request, Response, WireRequest, WireResponse};
use crate::memory::SyncPolicy;

/// The per-value transformation a worker applies.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, x: f64) -> f64;
}

/// `x -> 2x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Doubling;

impl Transform for Doubling {
    fn apply(&self, x: f64) -> f64 {
        x * 2.0
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used in log events.
    pub name: String,
    pub sync_policy: SyncPolicy,
    pub max_frame_length: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "handoff-worker".to_string(),
            sync_policy: SyncPolicy::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Counters reported when the worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub handled: u64,
    pub rejected: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    name: String,
    join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the worker to exit. It exits once the coordinator side of the channel is gone.
    pub async fn join(self) -> Result<WorkerStats, WorkerError> {
        Ok(self.join.await?)
    }
}

/// Spawn `run_worker` on the tokio runtime.
pub fn spawn_worker<T: Transform>(transform: T, port: Port, config: WorkerConfig) -> WorkerHandle {
    let name = config.name.clone();
    let transform = Arc::new(transform);
    let join = tokio::spawn(async move { run_worker(transform, port, config).await });
    WorkerHandle { name, join }
}

/// Run the worker event loop until the channel closes.
pub async fn run_worker<T: Transform>(
    transform: Arc<T>,
    port: Port,
    config: WorkerConfig,
) -> WorkerStats {
    let (sender, mut receiver) = port.into_split();
    let mut request_codec = FrameCodec::<WireRequest>::with_max_frame_length(config.max_frame_length);
    let mut response_codec =
        FrameCodec::<WireResponse>::with_max_frame_length(config.max_frame_length);
    let mut stats = WorkerStats::default();

    tracing::info!(worker = %config.name, sync_policy = ?config.sync_policy, "Worker started");

    while let Some(envelope) = receiver.recv().await {
        let Envelope {
            id,
            frame,
            mut transfer,
        } = envelope;

        let (kind, response) = match decode_request(&mut request_codec, &frame, &mut transfer) {
            Ok(request) => {
                stats.handled += 1;
                let kind = request.kind();
                tracing::debug!(id, kind, mode = %request.mode(), "Request received");
                (
                    Some(kind.to_string()),
                    handle_request(transform.as_ref(), request, config.sync_policy),
                )
            }
            Err((kind, reason)) => {
                stats.rejected += 1;
                tracing::warn!(id, kind = ?kind, %reason, "Rejecting request");
                let returned = transfer.into_unclaimed_buffers().into_iter().next();
                let response = Response::Unsupported {
                    kind: kind.clone(),
                    reason,
                    returned,
                };
                (kind, response)
            }
        };

        let Some(reply) = encode_response(&mut response_codec, id, kind, response) else {
            continue;
        };
        if sender.post(reply).is_err() {
            tracing::warn!(id, "Coordinator gone before response could be posted");
            break;
        }
    }

    tracing::info!(
        worker = %config.name,
        handled = stats.handled,
        rejected = stats.rejected,
        "Channel closed, worker exiting"
    );
    stats
}

fn decode_request(
    codec: &mut FrameCodec<WireRequest>,
    frame: &tokio_util::bytes::Bytes,
    transfer: &mut TransferList,
) -> Result<Request, (Option<String>, String)> {
    let wire = codec
        .decode_frame(frame)
        .map_err(|e| (peek_kind(frame), format!("malformed request: {e}")))?;
    let kind = wire.kind();
    Request::from_wire(wire, transfer).map_err(|e| (Some(kind.to_string()), e.to_string()))
}

/// Best-effort read of the `type` tag from a frame that did not decode.
fn peek_kind(frame: &tokio_util::bytes::Bytes) -> Option<String> {
    let value = FrameCodec::<serde_json::Value>::new()
        .decode_frame(frame)
        .ok()?;
    value.get("type")?.as_str().map(str::to_owned)
}

/// Apply the transform according to the request's mode.
pub fn handle_request<T: Transform + ?Sized>(
    transform: &T,
    request: Request,
    sync_policy: SyncPolicy,
) -> Response {
    match request {
        Request::Scalar(x) => Response::ScalarResult(transform.apply(x)),
        Request::Collection(items) => Response::CollectionResult(
            items.iter().map(|item| transform.apply(item.value)).collect(),
        ),
        Request::SharedBuffer { region, length } => {
            warn_if_clamped(Mode::Shared, length, region.len());
            let touched = match sync_policy {
                SyncPolicy::Unsynchronized => region.update_prefix(length, |x| transform.apply(x)),
                SyncPolicy::Locked => region.lock().update_prefix(length, |x| transform.apply(x)),
            };
            tracing::trace!(region = %region.id(), touched, "Shared region updated in place");
            Response::SharedDone
        }
        Request::TransferBuffer { mut buffer, length } => {
            warn_if_clamped(Mode::Transfer, length, buffer.len());
            match buffer.update_prefix(length, |x| transform.apply(x)) {
                Ok(touched) => {
                    tracing::trace!(touched, "Transferred buffer updated in place");
                    Response::TransferResult(buffer)
                }
                Err(e) => Response::Unsupported {
                    kind: Some("DOUBLE_ARRAY_TRANSFER".to_string()),
                    reason: e.to_string(),
                    returned: Some(buffer),
                },
            }
        }
    }
}

fn warn_if_clamped(mode: Mode, length: usize, capacity: usize) {
    if length > capacity {
        tracing::warn!(%mode, length, capacity, "Requested length exceeds storage, clamping");
    }
}

fn encode_response(
    codec: &mut FrameCodec<WireResponse>,
    id: u64,
    kind: Option<String>,
    response: Response,
) -> Option<Envelope> {
    let response_kind = response.kind();
    let error = match response.into_wire() {
        Ok((wire, transfer)) => match codec.encode_frame(wire) {
            Ok(frame) => {
                tracing::trace!(id, kind = response_kind, "Posting response");
                return Some(Envelope::new(id, frame, transfer));
            }
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    // The result itself could not be framed, e.g. a copied result larger
    // than the frame limit. Report that instead.
    tracing::warn!(id, kind = response_kind, %error, "Response could not be encoded");
    let rejection = WireResponse::UnsupportedRequest {
        payload: crate::bridge::protocol::Rejection {
            kind,
            reason: format!("response could not be encoded: {error}"),
            returned: None,
        },
    };
    match codec.encode_frame(rejection) {
        Ok(frame) => Some(Envelope::new(id, frame, TransferList::new())),
        Err(e) => {
            tracing::error!(id, error = %e, "Failed to encode rejection, dropping response");
            None
        }
    }
}

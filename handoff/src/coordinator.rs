//! Coordinator - builds requests, dispatches them, and routes responses back.
//!
//! Flow:
//! 1. Provision the channel and spawn the worker (`Coordinator::spawn`)
//! 2. Spawn the router task that owns the handler slots
//! 3. `dispatch`: encode the request, register its handler slot, post the envelope
//! 4. Router decodes each worker envelope and completes the matching handler
//! 5. On worker exit: fail every pending handler
//!
//! Dispatch never waits on the worker. The returned `PendingResponse` is the
//! registered handler; awaiting it is optional and can happen later.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::channel::{
    ChannelClosed, Envelope, Port, PortReceiver, PortSender, TransferList, pair,
};
use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use crate::bridge::protocol::{Mode, ProtocolError, Request, Response, WireRequest, WireResponse};
use crate::memory::{BufferError, OwnedBuffer, SharedRegion, SyncPolicy};
use crate::slot::{HandlerSlots, Registration, Reply, Routed};
use crate::worker::{Doubling, Transform, WorkerConfig, WorkerHandle, spawn_worker};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("worker channel closed")]
    ChannelClosed,

    #[error("{mode} request {id} superseded by a later {mode} request")]
    Superseded { mode: Mode, id: u64 },

    /// The worker refused the request. An owned buffer the request carried
    /// comes back in `returned`.
    #[error("worker rejected {kind:?} request: {reason}")]
    Unsupported {
        kind: Option<String>,
        reason: String,
        returned: Option<OwnedBuffer>,
    },

    /// The request never reached the worker. The owned buffer it carried is
    /// handed back.
    #[error("request not sent: {source}")]
    NotSent {
        source: Box<CoordinatorError>,
        returned: OwnedBuffer,
    },

    #[error("expected a {expected} response, got {found}")]
    UnexpectedResponse { expected: Mode, found: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub worker: WorkerConfig,
    pub max_frame_length: Option<usize>,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.worker.sync_policy = sync_policy;
        self
    }

    /// Frame limit for both directions.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = Some(max_frame_length);
        self.worker.max_frame_length = max_frame_length;
        self
    }

    fn frame_limit(&self) -> usize {
        self.max_frame_length.unwrap_or(DEFAULT_MAX_FRAME_LENGTH)
    }
}

/// A dispatched request whose handler slot is registered.
pub struct PendingResponse {
    id: u64,
    mode: Mode,
    reply_rx: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn recv(self) -> Result<Response, CoordinatorError> {
        self.await
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, CoordinatorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.reply_rx.poll_unpin(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            // router is gone without answering
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoordinatorError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Coordinator side of the channel.
pub struct Coordinator {
    sender: PortSender,
    register_tx: mpsc::UnboundedSender<Registration>,
    next_id: AtomicU64,
    max_frame_length: usize,
}

impl Coordinator {
    /// Provision a channel, spawn a doubling worker and connect to it.
    pub fn spawn(config: CoordinatorConfig) -> (Self, WorkerHandle) {
        Self::spawn_with(Doubling, config)
    }

    pub fn spawn_with<T: Transform>(transform: T, config: CoordinatorConfig) -> (Self, WorkerHandle) {
        let (coordinator_port, worker_port) = pair();
        let max_frame_length = config.frame_limit();
        let worker = spawn_worker(transform, worker_port, config.worker);
        tracing::info!(worker = %worker.name(), max_frame_length, "Worker spawned");
        (Self::connect(coordinator_port, max_frame_length), worker)
    }

    /// Attach to a port whose peer is already served by a worker.
    pub fn connect(port: Port, max_frame_length: usize) -> Self {
        let (sender, receiver) = port.into_split();
        let (register_tx, register_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            run_router(receiver, register_rx, max_frame_length).await;
        });

        Self {
            sender,
            register_tx,
            next_id: AtomicU64::new(1),
            max_frame_length,
        }
    }

    /// Send a request and register its handler without waiting for the response.
    ///
    /// Copy-mode data is encoded into the frame before this returns, so later
    /// changes to the caller's values cannot reach the worker. Storage in the
    /// request (region handle, owned buffer) moves into the envelope.
    pub fn dispatch(&self, request: Request) -> Result<PendingResponse, CoordinatorError> {
        let mode = request.mode();
        let kind = request.kind();
        let (wire, transfer) = request.into_wire()?;
        let frame = match FrameCodec::<WireRequest>::with_max_frame_length(self.max_frame_length)
            .encode_frame(wire)
        {
            Ok(frame) => frame,
            Err(e) => return Err(not_sent(ProtocolError::from(e).into(), transfer)),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register before posting so the router knows the id by the time a reply can exist.
        if self
            .register_tx
            .send(Registration { mode, id, reply_tx })
            .is_err()
        {
            return Err(not_sent(CoordinatorError::ChannelClosed, transfer));
        }
        if let Err(ChannelClosed(envelope)) =
            self.sender.post(Envelope::new(id, frame, transfer))
        {
            return Err(not_sent(CoordinatorError::ChannelClosed, envelope.transfer));
        }

        tracing::debug!(id, kind, %mode, "Request dispatched");
        Ok(PendingResponse { id, mode, reply_rx })
    }

    /// Copy `x` to the worker and return `2x`.
    pub async fn compute_scalar(&self, x: f64) -> Result<f64, CoordinatorError> {
        match self.dispatch(Request::scalar(x))?.await? {
            Response::ScalarResult(y) => Ok(y),
            other => Err(unexpected(Mode::Scalar, other)),
        }
    }

    /// Deep-copy `xs` as `{value: x}` items and return the doubled values in order.
    pub async fn compute_collection(&self, xs: &[f64]) -> Result<Vec<f64>, CoordinatorError> {
        match self.dispatch(Request::collection(xs))?.await? {
            Response::CollectionResult(values) => Ok(values),
            other => Err(unexpected(Mode::Collection, other)),
        }
    }

    /// Write `xs` into a new shared region, have the worker double it in place,
    /// and return the region once the worker acknowledges.
    pub async fn compute_shared(&self, xs: &[f64]) -> Result<SharedRegion, CoordinatorError> {
        let region = SharedRegion::from_slice(xs);
        self.compute_shared_in(&region, xs.len()).await?;
        Ok(region)
    }

    /// Dispatch an existing region. Only the handle and `length` cross the channel.
    pub async fn compute_shared_in(
        &self,
        region: &SharedRegion,
        length: usize,
    ) -> Result<(), CoordinatorError> {
        let request = Request::SharedBuffer {
            region: region.clone(),
            length,
        };
        match self.dispatch(request)?.await? {
            Response::SharedDone => Ok(()),
            other => Err(unexpected(Mode::Shared, other)),
        }
    }

    /// Move `xs` into an owned buffer, hand it to the worker, and read it back.
    pub async fn compute_transfer(&self, xs: &[f64]) -> Result<Vec<f64>, CoordinatorError> {
        let buffer = self.transfer(OwnedBuffer::from_slice(xs)).await?;
        Ok(buffer.into_vec()?)
    }

    /// Move `buffer` through the worker; ownership comes back with the result.
    pub async fn transfer(&self, buffer: OwnedBuffer) -> Result<OwnedBuffer, CoordinatorError> {
        match self.dispatch(Request::transfer(buffer))?.await? {
            Response::TransferResult(buffer) => Ok(buffer),
            other => Err(unexpected(Mode::Transfer, other)),
        }
    }
}

/// Attach the request's owned buffer, if any, to a send failure.
fn not_sent(error: CoordinatorError, transfer: TransferList) -> CoordinatorError {
    match transfer.into_unclaimed_buffers().into_iter().next() {
        Some(returned) => {
            tracing::debug!(%error, "Request not sent, handing buffer back");
            CoordinatorError::NotSent {
                source: Box::new(error),
                returned,
            }
        }
        None => error,
    }
}

fn unexpected(mode: Mode, response: Response) -> CoordinatorError {
    match response {
        Response::Unsupported {
            kind,
            reason,
            returned,
        } => CoordinatorError::Unsupported {
            kind,
            reason,
            returned,
        },
        other => CoordinatorError::UnexpectedResponse {
            expected: mode,
            found: other.kind(),
        },
    }
}

async fn run_router(
    mut receiver: PortReceiver,
    mut register_rx: mpsc::UnboundedReceiver<Registration>,
    max_frame_length: usize,
) {
    let mut slots = HandlerSlots::new();
    let mut codec = FrameCodec::<WireResponse>::with_max_frame_length(max_frame_length);

    loop {
        tokio::select! {
            biased;

            Some(registration) = register_rx.recv() => {
                tracing::trace!(id = registration.id, mode = %registration.mode, "Registered handler");
                slots.register(registration);
            }

            envelope = receiver.recv() => {
                let Some(envelope) = envelope else {
                    tracing::warn!(pending = slots.len(), "Worker channel closed");
                    slots.fail_all(|| CoordinatorError::ChannelClosed);
                    break;
                };
                let id = envelope.id;
                match slots.resolve(id, decode_response(&mut codec, envelope)) {
                    Routed::Delivered(mode) => {
                        tracing::debug!(id, %mode, "Response delivered");
                    }
                    Routed::Abandoned(mode) => {
                        tracing::debug!(id, %mode, "Response arrived after caller stopped waiting");
                    }
                    Routed::Unmatched => {
                        tracing::warn!(id, "Dropping response for superseded or unknown request");
                    }
                }
            }
        }
    }

    tracing::debug!("Router exiting");
}

fn decode_response(codec: &mut FrameCodec<WireResponse>, envelope: Envelope) -> Reply {
    let Envelope {
        frame,
        mut transfer,
        ..
    } = envelope;
    let wire = codec.decode_frame(&frame).map_err(ProtocolError::from)?;
    Ok(Response::from_wire(wire, &mut transfer)?)
}

//! In-process message channel between the coordinator and the worker.
//!
//! An `Envelope` carries three things:
//! - **id**: sequence number assigned by the coordinator, echoed by the worker
//! - **frame**: the JSON body, already encoded (a deep copy of the message)
//! - **transfer**: storage that crosses without copying: shared region handles
//!   (aliased) and owned buffers (moved). The body references entries by index.

use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use super::protocol::{AttachmentRef, ProtocolError};
use crate::memory::{OwnedBuffer, SharedRegion};

/// Storage listed in an envelope's transfer list.
#[derive(Debug)]
pub enum Transferable {
    Shared(SharedRegion),
    Owned(OwnedBuffer),
}

impl Transferable {
    fn kind(&self) -> &'static str {
        match self {
            Self::Shared(_) => "shared region",
            Self::Owned(_) => "owned buffer",
        }
    }
}

/// Side table of storage carried next to a frame.
///
/// Entries are claimed by index exactly once while decoding.
#[derive(Debug, Default)]
pub struct TransferList {
    entries: Vec<Option<Transferable>>,
}

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Transferable) -> AttachmentRef {
        let attachment = self.entries.len();
        self.entries.push(Some(item));
        AttachmentRef { attachment }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take_shared(&mut self, at: AttachmentRef) -> Result<SharedRegion, ProtocolError> {
        match self.take(at)? {
            Transferable::Shared(region) => Ok(region),
            other => {
                let found = other.kind();
                self.restore(at, other);
                Err(ProtocolError::AttachmentKind {
                    index: at.attachment,
                    expected: "shared region",
                    found,
                })
            }
        }
    }

    pub fn take_owned(&mut self, at: AttachmentRef) -> Result<OwnedBuffer, ProtocolError> {
        match self.take(at)? {
            Transferable::Owned(buffer) => Ok(buffer),
            other => {
                let found = other.kind();
                self.restore(at, other);
                Err(ProtocolError::AttachmentKind {
                    index: at.attachment,
                    expected: "owned buffer",
                    found,
                })
            }
        }
    }

    /// Owned buffers nobody claimed, so a rejecting side can hand them back.
    pub fn into_unclaimed_buffers(self) -> Vec<OwnedBuffer> {
        self.entries
            .into_iter()
            .filter_map(|entry| match entry {
                Some(Transferable::Owned(buffer)) => Some(buffer),
                _ => None,
            })
            .collect()
    }

    fn take(&mut self, at: AttachmentRef) -> Result<Transferable, ProtocolError> {
        self.entries
            .get_mut(at.attachment)
            .and_then(Option::take)
            .ok_or(ProtocolError::MissingAttachment {
                index: at.attachment,
            })
    }

    fn restore(&mut self, at: AttachmentRef, item: Transferable) {
        if let Some(entry) = self.entries.get_mut(at.attachment) {
            *entry = Some(item);
        }
    }
}

/// One channel send.
#[derive(Debug)]
pub struct Envelope {
    pub id: u64,
    pub frame: Bytes,
    pub transfer: TransferList,
}

impl Envelope {
    pub fn new(id: u64, frame: Bytes, transfer: TransferList) -> Self {
        Self {
            id,
            frame,
            transfer,
        }
    }
}

/// The peer is gone. Holds the envelope that could not be delivered, so the
/// sender can reclaim what it carried.
#[derive(Debug, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed(pub Envelope);

/// Sending half of a port. Posting never waits.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PortSender {
    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.tx
            .send(envelope)
            .map_err(|mpsc::error::SendError(envelope)| ChannelClosed(envelope))
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl PortReceiver {
    /// Next envelope, or `None` once every sender on the other side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// One end of a bidirectional channel.
#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.sender.post(envelope)
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub fn into_split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create two connected ports: `(coordinator side, worker side)`.
pub fn pair() -> (Port, Port) {
    let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
    let (to_coordinator_tx, to_coordinator_rx) = mpsc::unbounded_channel();

    let coordinator = Port {
        sender: PortSender { tx: to_worker_tx },
        receiver: PortReceiver {
            rx: to_coordinator_rx,
        },
    };
    let worker = Port {
        sender: PortSender {
            tx: to_coordinator_tx,
        },
        receiver: PortReceiver { rx: to_worker_rx },
    };

    tracing::trace!("Created channel pair");
    (coordinator, worker)
}

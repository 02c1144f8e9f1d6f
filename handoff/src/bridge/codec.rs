//! Frame codec for the coordinator/worker channel.
//!
//! A 4-byte big-endian length prefix (LengthDelimitedCodec) followed by a
//! serde_json body.
//! Encoding a message into a frame is the deep copy: once encoded, the frame
//! shares no storage with the value it was built from.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound on a single frame, matching LengthDelimitedCodec.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const LENGTH_FIELD_BYTES: usize = 4;

/// JSON bodies at or above this size are logged: copy mode pays for every byte.
const LARGE_COPY_BYTES: usize = 100_000;

/// Frames messages with a length prefix and serializes them with JSON.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .max_frame_length(max_frame_length)
                .new_codec(),
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl<T: Serialize> FrameCodec<T> {
    /// Serialize one message and wrap it in a length-prefixed frame.
    ///
    /// Fails with `InvalidInput` when the body exceeds the frame limit.
    pub fn encode_frame(&mut self, item: T) -> io::Result<Bytes> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if body.len() >= LARGE_COPY_BYTES {
            tracing::info!(
                body_bytes = body.len(),
                max_frame_length = self.max_frame_length(),
                "Copying large message into frame"
            );
        } else {
            tracing::trace!(body_bytes = body.len(), "Encoding frame");
        }

        let mut frame = BytesMut::with_capacity(body.len() + LENGTH_FIELD_BYTES);
        self.inner.encode(Bytes::from(body), &mut frame)?;
        Ok(frame.freeze())
    }
}

impl<T: DeserializeOwned> FrameCodec<T> {
    /// Decode a frame produced by `encode_frame`.
    ///
    /// A frame cut short is `UnexpectedEof`; a body that does not parse as `T`
    /// is `InvalidData`.
    pub fn decode_frame(&mut self, frame: &Bytes) -> io::Result<T> {
        let mut src = BytesMut::from(&frame[..]);
        let body = self
            .inner
            .decode(&mut src)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete frame"))?;
        serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

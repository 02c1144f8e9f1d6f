//! Wire protocol types for coordinator/worker communication.
//!
//! Two layers:
//! - **Wire types** (`WireRequest`/`WireResponse`): the JSON body of a frame.
//!   Tagged by `type`, payload under `payload`.
//! - **Typed messages** (`Request`/`Response`): what callers handle. They own
//!   real region handles and buffers, which are split off into the envelope's
//!   transfer list on the way out and claimed back on the way in.

use serde::{Deserialize, Serialize};

use super::channel::{TransferList, Transferable};
use crate::memory::{OwnedBuffer, SharedRegion};

/// Data-exchange mode. One coordinator handler slot exists per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Scalar,
    Collection,
    Shared,
    Transfer,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scalar => "scalar",
            Self::Collection => "collection",
            Self::Shared => "shared",
            Self::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// Index into an envelope's transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment: usize,
}

/// One element of a collection request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(with = "wire_f64")]
    pub value: f64,
}

/// Shared-buffer payload: which attachment holds the handle, and how many slots to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDescriptor {
    pub buffer: AttachmentRef,
    pub length: usize,
}

/// Why the worker refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// The request's `type` tag, when one could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub reason: String,
    /// Owned buffer handed back because the request carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned: Option<AttachmentRef>,
}

/// Request body, coordinator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireRequest {
    Scalar {
        #[serde(with = "wire_f64")]
        payload: f64,
    },
    DoubleArray {
        payload: Vec<Item>,
    },
    DoubleArraySharedBuffer {
        payload: SharedDescriptor,
    },
    DoubleArrayTransfer {
        payload: AttachmentRef,
        length: usize,
    },
}

impl WireRequest {
    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar { .. } => "SCALAR",
            Self::DoubleArray { .. } => "DOUBLE_ARRAY",
            Self::DoubleArraySharedBuffer { .. } => "DOUBLE_ARRAY_SHARED_BUFFER",
            Self::DoubleArrayTransfer { .. } => "DOUBLE_ARRAY_TRANSFER",
        }
    }
}

/// Response body, worker to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireResponse {
    ScalarResult {
        #[serde(with = "wire_f64")]
        payload: f64,
    },
    DoubleArrayResult {
        #[serde(with = "wire_f64::seq")]
        payload: Vec<f64>,
    },
    /// Results are already visible through the shared region.
    SharedDone,
    TransferResult {
        payload: AttachmentRef,
        length: usize,
    },
    UnsupportedRequest {
        payload: Rejection,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame codec error: {0}")]
    Codec(#[from] std::io::Error),

    #[error("attachment {index} missing from transfer list")]
    MissingAttachment { index: usize },

    #[error("attachment {index} is a {found}, expected a {expected}")]
    AttachmentKind {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot transfer a detached buffer")]
    DetachedBuffer,
}

/// Typed request, holding real storage.
#[derive(Debug)]
pub enum Request {
    Scalar(f64),
    Collection(Vec<Item>),
    SharedBuffer { region: SharedRegion, length: usize },
    TransferBuffer { buffer: OwnedBuffer, length: usize },
}

impl Request {
    pub fn scalar(x: f64) -> Self {
        Self::Scalar(x)
    }

    /// Wrap each value as `{value: x}`.
    pub fn collection(xs: &[f64]) -> Self {
        Self::Collection(xs.iter().map(|&value| Item { value }).collect())
    }

    /// Process the whole region.
    pub fn shared(region: SharedRegion) -> Self {
        let length = region.len();
        Self::SharedBuffer { region, length }
    }

    /// Process the whole buffer, taking ownership of it.
    pub fn transfer(buffer: OwnedBuffer) -> Self {
        let length = buffer.len();
        Self::TransferBuffer { buffer, length }
    }

    /// Detach `buffer` into a transfer request, leaving the caller's binding detached.
    pub fn transfer_from(buffer: &mut OwnedBuffer) -> Self {
        Self::transfer(buffer.detach())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "SCALAR",
            Self::Collection(_) => "DOUBLE_ARRAY",
            Self::SharedBuffer { .. } => "DOUBLE_ARRAY_SHARED_BUFFER",
            Self::TransferBuffer { .. } => "DOUBLE_ARRAY_TRANSFER",
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::Scalar(_) => Mode::Scalar,
            Self::Collection(_) => Mode::Collection,
            Self::SharedBuffer { .. } => Mode::Shared,
            Self::TransferBuffer { .. } => Mode::Transfer,
        }
    }

    /// Split into a wire body and the storage that travels beside it.
    pub fn into_wire(self) -> Result<(WireRequest, TransferList), ProtocolError> {
        let mut transfer = TransferList::new();
        let wire = match self {
            Self::Scalar(x) => WireRequest::Scalar { payload: x },
            Self::Collection(items) => WireRequest::DoubleArray { payload: items },
            Self::SharedBuffer { region, length } => {
                let buffer = transfer.push(Transferable::Shared(region));
                WireRequest::DoubleArraySharedBuffer {
                    payload: SharedDescriptor { buffer, length },
                }
            }
            Self::TransferBuffer { buffer, length } => {
                if buffer.is_detached() {
                    return Err(ProtocolError::DetachedBuffer);
                }
                let payload = transfer.push(Transferable::Owned(buffer));
                WireRequest::DoubleArrayTransfer { payload, length }
            }
        };
        Ok((wire, transfer))
    }

    /// Rebuild a typed request, claiming its storage from `transfer`.
    pub fn from_wire(wire: WireRequest, transfer: &mut TransferList) -> Result<Self, ProtocolError> {
        match wire {
            WireRequest::Scalar { payload } => Ok(Self::Scalar(payload)),
            WireRequest::DoubleArray { payload } => Ok(Self::Collection(payload)),
            WireRequest::DoubleArraySharedBuffer { payload } => {
                let region = transfer.take_shared(payload.buffer)?;
                Ok(Self::SharedBuffer {
                    region,
                    length: payload.length,
                })
            }
            WireRequest::DoubleArrayTransfer { payload, length } => {
                let buffer = transfer.take_owned(payload)?;
                Ok(Self::TransferBuffer { buffer, length })
            }
        }
    }
}

/// Typed response, holding real storage.
#[derive(Debug)]
pub enum Response {
    ScalarResult(f64),
    CollectionResult(Vec<f64>),
    SharedDone,
    TransferResult(OwnedBuffer),
    Unsupported {
        kind: Option<String>,
        reason: String,
        returned: Option<OwnedBuffer>,
    },
}

impl Response {
    /// Mode this response answers; `None` for a rejection.
    pub fn mode(&self) -> Option<Mode> {
        match self {
            Self::ScalarResult(_) => Some(Mode::Scalar),
            Self::CollectionResult(_) => Some(Mode::Collection),
            Self::SharedDone => Some(Mode::Shared),
            Self::TransferResult(_) => Some(Mode::Transfer),
            Self::Unsupported { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScalarResult(_) => "SCALAR_RESULT",
            Self::CollectionResult(_) => "DOUBLE_ARRAY_RESULT",
            Self::SharedDone => "SHARED_DONE",
            Self::TransferResult(_) => "TRANSFER_RESULT",
            Self::Unsupported { .. } => "UNSUPPORTED_REQUEST",
        }
    }

    pub fn into_wire(self) -> Result<(WireResponse, TransferList), ProtocolError> {
        let mut transfer = TransferList::new();
        let wire = match self {
            Self::ScalarResult(x) => WireResponse::ScalarResult { payload: x },
            Self::CollectionResult(values) => WireResponse::DoubleArrayResult { payload: values },
            Self::SharedDone => WireResponse::SharedDone,
            Self::TransferResult(buffer) => {
                let length = buffer.len();
                let payload = transfer.push(Transferable::Owned(buffer));
                WireResponse::TransferResult { payload, length }
            }
            Self::Unsupported {
                kind,
                reason,
                returned,
            } => {
                let returned = returned.map(|buffer| transfer.push(Transferable::Owned(buffer)));
                WireResponse::UnsupportedRequest {
                    payload: Rejection {
                        kind,
                        reason,
                        returned,
                    },
                }
            }
        };
        Ok((wire, transfer))
    }

    pub fn from_wire(
        wire: WireResponse,
        transfer: &mut TransferList,
    ) -> Result<Self, ProtocolError> {
        match wire {
            WireResponse::ScalarResult { payload } => Ok(Self::ScalarResult(payload)),
            WireResponse::DoubleArrayResult { payload } => Ok(Self::CollectionResult(payload)),
            WireResponse::SharedDone => Ok(Self::SharedDone),
            WireResponse::TransferResult { payload, .. } => {
                Ok(Self::TransferResult(transfer.take_owned(payload)?))
            }
            WireResponse::UnsupportedRequest { payload } => {
                let returned = payload
                    .returned
                    .map(|at| transfer.take_owned(at))
                    .transpose()?;
                Ok(Self::Unsupported {
                    kind: payload.kind,
                    reason: payload.reason,
                    returned,
                })
            }
        }
    }
}

/// Serde adapter for copied `f64` values.
///
/// Finite values are plain JSON numbers. JSON has no literal for NaN or the
/// infinities, so those travel as the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`.
mod wire_f64 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    struct WireF64(f64);

    impl Serialize for WireF64 {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let x = self.0;
            if x.is_finite() {
                serializer.serialize_f64(x)
            } else if x.is_nan() {
                serializer.serialize_str(NAN)
            } else if x > 0.0 {
                serializer.serialize_str(INFINITY)
            } else {
                serializer.serialize_str(NEG_INFINITY)
            }
        }
    }

    impl<'de> Deserialize<'de> for WireF64 {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Repr {
                Number(f64),
                Named(String),
            }

            match Repr::deserialize(deserializer)? {
                Repr::Number(x) => Ok(Self(x)),
                Repr::Named(name) => match name.as_str() {
                    NAN => Ok(Self(f64::NAN)),
                    INFINITY => Ok(Self(f64::INFINITY)),
                    NEG_INFINITY => Ok(Self(f64::NEG_INFINITY)),
                    other => Err(D::Error::custom(format_args!(
                        "expected a number, \"NaN\", \"Infinity\" or \"-Infinity\", found \"{other}\""
                    ))),
                },
            }
        }
    }

    pub fn serialize<S: Serializer>(x: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        WireF64(*x).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        WireF64::deserialize(deserializer).map(|wire| wire.0)
    }

    pub mod seq {
        use super::*;

        pub fn serialize<S: Serializer>(xs: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(xs.iter().map(|&x| WireF64(x)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            let values = Vec::<WireF64>::deserialize(deserializer)?;
            Ok(values.into_iter().map(|wire| wire.0).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_serializes() {
        let req = WireRequest::Scalar { payload: 1.5 };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "SCALAR",
          "payload": 1.5
        }
        "#);
    }

    #[test]
    fn double_array_serializes() {
        let req = WireRequest::DoubleArray {
            payload: vec![Item { value: 2.0 }, Item { value: 3.0 }],
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "DOUBLE_ARRAY", "payload": [{"value": 2.0}, {"value": 3.0}]})
        );
    }

    #[test]
    fn shared_buffer_serializes() {
        let req = WireRequest::DoubleArraySharedBuffer {
            payload: SharedDescriptor {
                buffer: AttachmentRef { attachment: 0 },
                length: 3,
            },
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "type": "DOUBLE_ARRAY_SHARED_BUFFER",
                "payload": {
                    "buffer": {"attachment": 0},
                    "length": 3
                }
            })
        );
    }

    #[test]
    fn transfer_serializes_with_length() {
        let req = WireRequest::DoubleArrayTransfer {
            payload: AttachmentRef { attachment: 0 },
            length: 3,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "DOUBLE_ARRAY_TRANSFER",
          "payload": {
            "attachment": 0
          },
          "length": 3
        }
        "#);
    }

    #[test]
    fn shared_done_has_no_payload() {
        insta::assert_json_snapshot!(WireResponse::SharedDone, @r#"
        {
          "type": "SHARED_DONE"
        }
        "#);
    }

    #[test]
    fn double_array_result_serializes() {
        let resp = WireResponse::DoubleArrayResult {
            payload: vec![4.0, 6.0, 8.0],
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"type": "DOUBLE_ARRAY_RESULT", "payload": [4.0, 6.0, 8.0]})
        );
    }

    #[test]
    fn unsupported_request_omits_empty_fields() {
        let resp = WireResponse::UnsupportedRequest {
            payload: Rejection {
                kind: None,
                reason: "frame is not JSON".to_string(),
                returned: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"type": "UNSUPPORTED_REQUEST", "payload": {"reason": "frame is not JSON"}})
        );
    }

    #[test]
    fn wire_kind_matches_serialized_tag() {
        let req = WireRequest::DoubleArrayTransfer {
            payload: AttachmentRef { attachment: 0 },
            length: 1,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["type"], json!(req.kind()));
    }

    #[test]
    fn unknown_request_tag_fails_to_parse() {
        let parsed = serde_json::from_value::<WireRequest>(json!({"type": "TRIPLE_ARRAY"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn transfer_without_length_fails_to_parse() {
        let parsed = serde_json::from_value::<WireRequest>(json!({
            "type": "DOUBLE_ARRAY_TRANSFER",
            "payload": {"attachment": 0}
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn collection_wraps_values() {
        let req = Request::collection(&[2.0, 3.0]);
        match req {
            Request::Collection(items) => {
                assert_eq!(items, vec![Item { value: 2.0 }, Item { value: 3.0 }]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn copy_modes_carry_no_attachments() {
        let (_, transfer) = Request::collection(&[1.0]).into_wire().unwrap();
        assert!(transfer.is_empty());
        let (_, transfer) = Request::scalar(1.0).into_wire().unwrap();
        assert!(transfer.is_empty());
    }

    #[test]
    fn non_finite_values_travel_as_names() {
        let resp = WireResponse::DoubleArrayResult {
            payload: vec![f64::INFINITY, -0.5, f64::NEG_INFINITY, f64::NAN],
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "DOUBLE_ARRAY_RESULT",
          "payload": [
            "Infinity",
            -0.5,
            "-Infinity",
            "NaN"
          ]
        }
        "#);

        let text = serde_json::to_string(&resp).unwrap();
        match serde_json::from_str::<WireResponse>(&text).unwrap() {
            WireResponse::DoubleArrayResult { payload } => {
                assert_eq!(payload[0], f64::INFINITY);
                assert_eq!(payload[1], -0.5);
                assert_eq!(payload[2], f64::NEG_INFINITY);
                assert!(payload[3].is_nan());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn non_finite_request_values_parse() {
        let parsed: WireRequest = serde_json::from_value(json!({
            "type": "DOUBLE_ARRAY",
            "payload": [{"value": "-Infinity"}, {"value": 1}]
        }))
        .unwrap();
        match parsed {
            WireRequest::DoubleArray { payload } => {
                assert_eq!(payload[0].value, f64::NEG_INFINITY);
                assert_eq!(payload[1].value, 1.0);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let parsed: WireRequest =
            serde_json::from_value(json!({"type": "SCALAR", "payload": "NaN"})).unwrap();
        assert!(matches!(parsed, WireRequest::Scalar { payload } if payload.is_nan()));
    }

    #[test]
    fn unknown_number_name_fails_to_parse() {
        let parsed =
            serde_json::from_value::<WireRequest>(json!({"type": "SCALAR", "payload": "lots"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn copied_values_are_bit_exact() {
        let values = [0.1, 1.0 / 3.0, std::f64::consts::PI, 4.673882229219307e-175, -1e300];
        let resp = WireResponse::DoubleArrayResult {
            payload: values.to_vec(),
        };
        let text = serde_json::to_string(&resp).unwrap();
        match serde_json::from_str::<WireResponse>(&text).unwrap() {
            WireResponse::DoubleArrayResult { payload } => {
                let bits: Vec<u64> = payload.iter().map(|x| x.to_bits()).collect();
                let expected: Vec<u64> = values.iter().map(|x| x.to_bits()).collect();
                assert_eq!(bits, expected);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn shared_request_sends_handle_not_data() {
        let region = SharedRegion::from_slice(&[5.0, 6.0, 7.0]);
        let (wire, mut transfer) = Request::shared(region.clone()).into_wire().unwrap();

        let body = serde_json::to_value(&wire).unwrap();
        assert_eq!(body["payload"]["length"], json!(3));
        assert!(body["payload"].get("values").is_none());

        match Request::from_wire(wire, &mut transfer).unwrap() {
            Request::SharedBuffer {
                region: received,
                length,
            } => {
                assert!(received.same_region(&region));
                assert_eq!(length, 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn transfer_request_moves_buffer() {
        let mut buffer = OwnedBuffer::from_slice(&[8.0, 9.0, 10.0]);
        let req = Request::transfer_from(&mut buffer);
        assert!(buffer.is_detached());

        let (wire, mut transfer) = req.into_wire().unwrap();
        assert_eq!(transfer.len(), 1);

        match Request::from_wire(wire, &mut transfer).unwrap() {
            Request::TransferBuffer { buffer, length } => {
                assert_eq!(length, 3);
                assert_eq!(buffer.as_slice().unwrap(), &[8.0, 9.0, 10.0]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn detached_buffer_cannot_be_transferred() {
        let mut buffer = OwnedBuffer::new(1);
        let _owner = buffer.detach();
        let err = Request::transfer(buffer).into_wire().unwrap_err();
        assert!(matches!(err, ProtocolError::DetachedBuffer));
    }

    #[test]
    fn rejection_hands_buffer_back() {
        let resp = Response::Unsupported {
            kind: Some("DOUBLE_ARRAY_TRANSFER".to_string()),
            reason: "bad length".to_string(),
            returned: Some(OwnedBuffer::from_slice(&[1.0])),
        };
        let (wire, mut transfer) = resp.into_wire().unwrap();

        match Response::from_wire(wire, &mut transfer).unwrap() {
            Response::Unsupported {
                kind,
                returned: Some(buffer),
                ..
            } => {
                assert_eq!(kind.as_deref(), Some("DOUBLE_ARRAY_TRANSFER"));
                assert_eq!(buffer.as_slice().unwrap(), &[1.0]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_modes() {
        assert_eq!(Response::SharedDone.mode(), Some(Mode::Shared));
        assert_eq!(Response::ScalarResult(1.0).kind(), "SCALAR_RESULT");
        let rejected = Response::Unsupported {
            kind: None,
            reason: String::new(),
            returned: None,
        };
        assert_eq!(rejected.mode(), None);
    }
}

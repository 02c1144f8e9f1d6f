//! Message bridge between the coordinator and the worker.
//!
//! # Architecture
//!
//! - **protocol**: Wire bodies (WireRequest/WireResponse) and typed messages (Request/Response)
//! - **codec**: JSON framing codec; encoding is the copy step of copy mode
//! - **channel**: Envelopes, transfer lists and the port pair

pub mod channel;
pub mod codec;
pub mod protocol;

//! Client-server communication protocol.
//!
//! This module implements the legacy binary wire protocol spoken between the driver and a
//! document database server: message framing, the typed operations a client can issue and the
//! replies it gets back, plus a frame transport over any async byte stream.
//!
//! # Overview
//!
//! The codec is pure and stateless. An [`Operation`] is encoded into a complete frame for a
//! given request id, and an OP_REPLY frame is decoded into a [`Reply`]. Correlating replies with
//! requests, acknowledging writes and reconnecting are the job of
//! [`Connection`](crate::connection::Connection); nothing here keeps state between frames.
//!
//! # Key Components
//!
//! - [`Operation`]: Query, insert, update, delete, get-more, kill-cursors and command messages.
//! - [`Reply`]: A decoded OP_REPLY with its flags, cursor id and documents.
//! - [`MsgHeader`]: The 16-byte header shared by every frame.
//! - [`ProtocolTransport`]: Reads and writes whole frames over a bidirectional stream.
//! - [`MemoryServer`]: An in-memory peer speaking the same protocol, for development and tests.
//!
//! # Binary Format
//!
//! ```text
//! [i32 messageLength][i32 requestId][i32 responseTo][i32 opCode][body ...]
//! ```
//!
//! - All integers are little-endian and fixed width.
//! - `responseTo` is zero on requests and echoes the request id on replies.
//! - Bodies hold C-string namespaces, op-specific integers and BSON documents.
//!
//! Documents are treated as opaque payload; server-reported failures inside them (duplicate
//! keys, failed commands) are interpreted one layer up.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): Multiplexes many in-flight operations over one socket.
mod request;
mod response;
mod server;
mod transport;
mod wire;

pub use request::{Operation, WriteConcern, flags as op_flags};
pub use response::{Reply, flags as reply_flags, get_int, is_ok};
pub use server::MemoryServer;
#[cfg(test)]
pub(crate) use server::{spawn_counting_test_server, spawn_test_server};
pub use transport::{ProtocolTransport, TransportError};
pub use wire::{CodecError, HEADER_SIZE, MAX_MESSAGE_SIZE, MsgHeader, OpCode, check_keys};

/// Encode `operation` into a frame carrying `request_id`.
pub fn encode(operation: &Operation, request_id: i32) -> Result<Vec<u8>, CodecError> {
    operation.encode(request_id)
}

/// Decode an OP_REPLY frame.
pub fn decode(frame: &[u8]) -> Result<Reply, CodecError> {
    Reply::decode(frame)
}

//! Wire protocol for the Doubao realtime dialogue service.
//!
//! This crate is pure data: the binary frame codec, the event identifiers
//! carried inside frames, and the typed JSON payloads the proxy sends
//! upstream. It performs no I/O, which keeps the framing layer exhaustively
//! testable in isolation from the WebSocket plumbing in the proxy service.

pub mod dialog;
pub mod event;
pub mod frame;

pub use frame::{Frame, MessageType, Payload, ProtocolError};

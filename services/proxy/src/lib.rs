//! Voicerelay Proxy Library Crate
//!
//! This library contains all the core logic for the voice proxy service:
//! environment configuration, routing, and the WebSocket bridges that
//! connect browser clients to the upstream realtime dialogue services. The
//! binaries under `bin/` are thin wrappers around this library.

pub mod config;
pub mod router;
pub mod ws;

//! matrix-relay: attaches a chat-relay bot to a Matrix homeserver.
//!
//! Outbound sends are gated on connection state and queued while the link
//! is down; inbound sync events are filtered and normalized before reaching
//! the rest of the bridge.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod channel;
pub mod matrix;

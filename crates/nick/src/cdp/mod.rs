//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: Single WebSocket connection, multiplexed sessions.
//! The event-streaming backend attaches one `CDPSession` per tab; the
//! step-queue backend talks to its bridge through a bare `CDPClient`.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::CDPClient;
pub use protocol::{CDPEvent, CDPRequest, CDPResponse};
pub use session::CDPSession;

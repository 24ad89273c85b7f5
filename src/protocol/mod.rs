//! Protocol definitions for the upstream console transport
//!
//! The upstream speaks JSON text frames shaped `{"event": "...", "args":
//! [...]}`. A small fixed vocabulary of control events drives the auth and
//! token lifecycle; everything else is opaque payload mirrored to clients.

mod message;

pub use message::{parse_control, ControlEvent, WireEvent};
pub use message::{
    EVENT_AUTH, EVENT_AUTH_ERROR, EVENT_AUTH_SUCCESS, EVENT_TOKEN_EXPIRED, EVENT_TOKEN_EXPIRING,
};

use serde::Serialize;

/// Frames delivered to an attached dashboard client channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// The shared upstream session is authenticated and live
    Ready,

    /// Verbatim upstream text payload
    Payload(String),

    /// Verbatim upstream binary payload
    Binary(Vec<u8>),

    /// The session is gone; no further frames will arrive
    Closed { reason: CloseReason },
}

/// Why a client channel was closed.
///
/// Each cause carries a distinct wire close code so a dashboard can tell
/// "you were idle-reaped" apart from "the backend connection was lost".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Administrative close or mux shutdown
    Requested,

    /// Idle grace period elapsed with no attached clients
    Idle,

    /// Upstream transport closed or errored
    UpstreamLost,
}

impl CloseReason {
    /// WebSocket close code for this reason
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::Requested => 4000,
            CloseReason::Idle => 4001,
            CloseReason::UpstreamLost => 4002,
        }
    }
}

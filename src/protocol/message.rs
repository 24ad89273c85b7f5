//! Message types for the upstream console protocol

use serde::{Deserialize, Serialize};

/// Wire event name for the token-carrying authentication request
pub const EVENT_AUTH: &str = "auth";

/// Wire event name for the upstream auth acknowledgment
pub const EVENT_AUTH_SUCCESS: &str = "auth success";

/// Wire event name for the upstream auth rejection
pub const EVENT_AUTH_ERROR: &str = "auth error";

/// Wire event name for the near-expiry notice
pub const EVENT_TOKEN_EXPIRING: &str = "token expiring";

/// Wire event name for the expired-token notice
pub const EVENT_TOKEN_EXPIRED: &str = "token expired";

/// Raw JSON shape of an upstream event: `{"event": "...", "args": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Control-plane events intercepted by the multiplexer.
///
/// These are handled internally and never forwarded to attached clients;
/// every other frame is opaque payload and passes through unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Authentication request carrying the bearer token (locally synthesized)
    Auth { token: String },

    /// Upstream acknowledged the token
    AuthSuccess,

    /// Upstream rejected the token
    AuthError { message: Option<String> },

    /// The current token is close to expiry
    TokenExpiring,

    /// The current token has expired
    TokenExpired,
}

impl ControlEvent {
    /// Wire name of this event
    pub fn event_name(&self) -> &'static str {
        match self {
            ControlEvent::Auth { .. } => EVENT_AUTH,
            ControlEvent::AuthSuccess => EVENT_AUTH_SUCCESS,
            ControlEvent::AuthError { .. } => EVENT_AUTH_ERROR,
            ControlEvent::TokenExpiring => EVENT_TOKEN_EXPIRING,
            ControlEvent::TokenExpired => EVENT_TOKEN_EXPIRED,
        }
    }

    /// Convert to the raw wire shape
    pub fn to_wire(&self) -> WireEvent {
        let args = match self {
            ControlEvent::Auth { token } => vec![token.clone()],
            ControlEvent::AuthError {
                message: Some(message),
            } => vec![message.clone()],
            _ => Vec::new(),
        };
        WireEvent {
            event: self.event_name().to_string(),
            args,
        }
    }

    /// Serialize to a wire text frame
    pub fn to_text(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.to_wire())?)
    }
}

/// Parse a control event out of an upstream text frame.
///
/// Returns `None` for anything that is not control-plane: payload events,
/// non-JSON frames, and JSON that does not match the wire shape. Those are
/// forwarded verbatim (or dropped pre-auth) by the caller.
pub fn parse_control(text: &str) -> Option<ControlEvent> {
    let wire: WireEvent = serde_json::from_str(text).ok()?;
    match wire.event.as_str() {
        EVENT_AUTH => Some(ControlEvent::Auth {
            token: wire.args.into_iter().next().unwrap_or_default(),
        }),
        EVENT_AUTH_SUCCESS => Some(ControlEvent::AuthSuccess),
        EVENT_AUTH_ERROR => Some(ControlEvent::AuthError {
            message: wire.args.into_iter().next(),
        }),
        EVENT_TOKEN_EXPIRING => Some(ControlEvent::TokenExpiring),
        EVENT_TOKEN_EXPIRED => Some(ControlEvent::TokenExpired),
        _ => None,
    }
}

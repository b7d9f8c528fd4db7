//! termchat wire protocol: message kinds and the message record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// All wire message kinds. Serialized as lowercase strings (`"hello"`, `"text"`, ...).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Joiner opens the handshake with the session it wants to attach to.
    Hello,
    /// Listener confirms the session id.
    Welcome,
    /// Joiner acknowledges Welcome; session becomes active on both ends.
    Ready,
    /// Chat content.
    Text,
    /// Liveness probe; answered with Pong.
    Ping,
    Pong,
    /// Graceful close.
    Leave,
    /// Failure reason sent to the peer (e.g. rejected handshake).
    Error,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Hello => "hello",
            Kind::Welcome => "welcome",
            Kind::Ready => "ready",
            Kind::Text => "text",
            Kind::Ping => "ping",
            Kind::Pong => "pong",
            Kind::Leave => "leave",
            Kind::Error => "error",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol unit. `content` and `session_id` are omitted from the wire when absent
/// and decode back to `None`, so "no content" stays distinct from "empty content".
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    /// New message stamped with the current time; `session_id` unset.
    pub fn new(kind: Kind, content: Option<String>) -> Self {
        Self {
            kind,
            content,
            session_id: None,
            timestamp: now_millis(),
        }
    }

    /// Hello or Welcome carrying the session id; `content` unset.
    pub fn handshake(kind: Kind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            content: None,
            session_id: Some(session_id.into()),
            timestamp: now_millis(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(Kind::Text, Some(content.into()))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(Kind::Error, Some(reason.into()))
    }

    /// Payload-free message (Ready, Ping, Pong, Leave).
    pub fn control(kind: Kind) -> Self {
        Self::new(kind, None)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

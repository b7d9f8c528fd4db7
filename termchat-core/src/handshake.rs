//! Handshake state machine. Host-driven: the caller feeds received messages and
//! writes whatever the machine hands back.
//!
//! ```text
//! joiner                     listener
//!   | -- hello{session_id} --> |   AwaitingHello
//!   | <- welcome{session_id} - |   AwaitingReady
//!   | -- ready --------------> |
//! Active                     Active
//! ```

use crate::protocol::{Kind, Message};

/// Which side of the handshake an endpoint plays.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Role {
    /// Opened the session; waits for Hello.
    Listener,
    /// Attaches to an existing session; sends Hello first.
    Joiner,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum HandshakeState {
    AwaitingHello,
    AwaitingWelcome,
    AwaitingReady,
    Active,
    Aborted,
}

/// What the caller must do after feeding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Write this message and keep reading.
    Send(Message),
    /// Write this message; the session is now active.
    SendAndActivate(Message),
    /// Nothing to write; the session is now active.
    Activate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid handshake: expected {expected}, got {got}")]
    UnexpectedMessage { expected: Kind, got: Kind },
    #[error("session ID mismatch: expected {expected}, got {got}")]
    SessionMismatch { expected: String, got: String },
    #[error("peer rejected handshake: {0}")]
    Rejected(String),
    #[error("stream closed during handshake")]
    Closed,
    #[error("handshake timed out")]
    TimedOut,
    #[error("handshake is not in progress")]
    NotInProgress,
}

/// A failed step: the error plus, when the peer should be told why, the Error message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub error: HandshakeError,
    pub notice: Option<Message>,
}

impl From<HandshakeError> for Rejection {
    fn from(error: HandshakeError) -> Self {
        Self {
            error,
            notice: None,
        }
    }
}

/// One handshake attempt for one stream.
#[derive(Debug, Clone)]
pub struct Handshake {
    role: Role,
    session_id: String,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: Role, session_id: impl Into<String>) -> Self {
        let state = match role {
            Role::Listener => HandshakeState::AwaitingHello,
            Role::Joiner => HandshakeState::AwaitingWelcome,
        };
        Self {
            role,
            session_id: session_id.into(),
            state,
        }
    }

    pub fn listener(session_id: impl Into<String>) -> Self {
        Self::new(Role::Listener, session_id)
    }

    pub fn joiner(session_id: impl Into<String>) -> Self {
        Self::new(Role::Joiner, session_id)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }

    /// Opening message for this role: Hello for a joiner, nothing for a listener.
    pub fn opening(&self) -> Option<Message> {
        match (self.role, self.state) {
            (Role::Joiner, HandshakeState::AwaitingWelcome) => {
                Some(Message::handshake(Kind::Hello, self.session_id.clone()))
            }
            _ => None,
        }
    }

    /// Feed the next received message.
    pub fn on_message(&mut self, msg: &Message) -> Result<Transition, Rejection> {
        let result = match self.state {
            HandshakeState::AwaitingHello => self.on_hello(msg),
            HandshakeState::AwaitingWelcome => self.on_welcome(msg),
            HandshakeState::AwaitingReady => self.on_ready(msg),
            HandshakeState::Active | HandshakeState::Aborted => {
                return Err(HandshakeError::NotInProgress.into())
            }
        };
        if result.is_err() {
            self.state = HandshakeState::Aborted;
        }
        result
    }

    /// Stream closed, or the read failed or timed out, before the handshake finished.
    pub fn abort(&mut self, error: HandshakeError) -> HandshakeError {
        if self.state != HandshakeState::Active {
            self.state = HandshakeState::Aborted;
        }
        error
    }

    fn on_hello(&mut self, msg: &Message) -> Result<Transition, Rejection> {
        if msg.kind != Kind::Hello {
            return Err(self.reject(
                "Expected HELLO message",
                HandshakeError::UnexpectedMessage {
                    expected: Kind::Hello,
                    got: msg.kind,
                },
            ));
        }
        let got = msg.session_id.as_deref().unwrap_or_default();
        if got != self.session_id {
            return Err(self.reject(
                "Session ID mismatch",
                HandshakeError::SessionMismatch {
                    expected: self.session_id.clone(),
                    got: got.to_string(),
                },
            ));
        }
        self.state = HandshakeState::AwaitingReady;
        Ok(Transition::Send(Message::handshake(
            Kind::Welcome,
            self.session_id.clone(),
        )))
    }

    fn on_welcome(&mut self, msg: &Message) -> Result<Transition, Rejection> {
        match msg.kind {
            Kind::Welcome => {
                self.state = HandshakeState::Active;
                Ok(Transition::SendAndActivate(Message::control(Kind::Ready)))
            }
            Kind::Error => Err(HandshakeError::Rejected(
                msg.content.clone().unwrap_or_default(),
            )
            .into()),
            got => Err(HandshakeError::UnexpectedMessage {
                expected: Kind::Welcome,
                got,
            }
            .into()),
        }
    }

    fn on_ready(&mut self, msg: &Message) -> Result<Transition, Rejection> {
        if msg.kind != Kind::Ready {
            return Err(HandshakeError::UnexpectedMessage {
                expected: Kind::Ready,
                got: msg.kind,
            }
            .into());
        }
        self.state = HandshakeState::Active;
        Ok(Transition::Activate)
    }

    fn reject(&self, reason: &str, error: HandshakeError) -> Rejection {
        Rejection {
            error,
            notice: Some(Message::error(reason)),
        }
    }
}

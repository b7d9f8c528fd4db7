//! termchat protocol core.
//! Host-driven: no I/O; the host feeds received messages and writes what it is handed back.

pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod wire;

pub use handshake::{Handshake, HandshakeError, HandshakeState, Rejection, Role, Transition};
pub use identity::IdGenerator;
pub use protocol::{Kind, Message};
pub use session::{Session, SessionState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};

//! termchat: ephemeral one-on-one terminal chat over a single byte stream.

pub mod config;
pub mod target;
pub mod telemetry;
pub mod transport;

pub use target::{Target, TargetError};
pub use transport::{Endpoint, EndpointError, Event, EventReceiver};

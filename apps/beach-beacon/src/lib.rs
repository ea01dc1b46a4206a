//! Beach signaling relay.
//!
//! Clients open a websocket, register an identity with their first message, and then
//! exchange `offer`/`answer`/`candidate` envelopes addressed by identity. The relay stamps
//! the sender on every forwarded envelope and answers unroutable ones with an `error`
//! envelope; it never looks inside negotiation payloads.

pub mod channel;
pub mod config;
pub mod envelope;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod websocket;

pub use channel::{ChannelError, Frame, FrameSink, FrameSource, PeerHandle, Termination};
pub use config::{Cli, ServerConfig};
pub use envelope::{Envelope, Signal};
pub use registry::ClientRegistry;
pub use server::Server;
pub use session::{deliver, ConnectionSession, DeliveryOutcome, SessionOutcome};

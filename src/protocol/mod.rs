//! Agent Communication Protocol (ACP)
//!
//! The message-based contract between the orchestration core and a
//! running worker:
//!
//! - **message**: wire frames and typed payloads
//! - **transport**: duplex TCP channel and HTTP polling fallback behind
//!   one capability interface
//! - **session**: handshake, heartbeat, request/response correlation,
//!   cancellation

pub mod message;
pub mod session;
pub mod transport;

pub use message::{AcpMessage, MessageType, Payload, TaskStatus};
pub use session::{ProtocolSession, SessionHealth, TaskOutcome};
pub use transport::{DuplexTransport, PollingTransport, Transport, TransportKind};

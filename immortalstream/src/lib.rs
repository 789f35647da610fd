//! Immortal streams -- byte streams that survive transport drops.
//!
//! A reliable session layer over replaceable transports:
//! - **ReliableStream**: ordered, exactly-once byte delivery with a bounded
//!   replay window and sequence-number resume
//! - **Reconnector**: one bounded dial per call, exchanging reader sequences
//!   over a fixed handshake
//! - **Supervisor**: background health loop that re-dials dropped streams
//!   and stops once the stream is permanently closed

pub mod adapter;
pub mod config;
pub mod error;
pub mod handshake;
pub mod reconnect;
pub mod registry;
pub mod replay;
pub mod signal;
pub mod stream;
pub mod supervisor;
pub mod transport;

// Re-export key public types at crate root.
pub use adapter::StreamIo;
pub use config::{Backoff, ReconnectorConfig, StreamConfig, SupervisorConfig};
pub use error::{CloseReason, ErrorClass, Result, StreamError};
pub use reconnect::{Reconnect, Reconnected, Reconnector};
pub use registry::{MemoryRegistry, RegistryError, StreamId, StreamInfo, StreamRegistry, StreamTarget};
pub use replay::ReplayBuffer;
pub use signal::{FailureListener, FailureSignal, PermanentFailure};
pub use stream::{Link, ReliableStream, StreamState};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use transport::{BoxedConnection, DialRequest, DialResponse, DialStrategy, Dialer, PathProbe};

//! Transport abstractions: the byte connection a dial produces, the dialers
//! that produce it, and the probe that picks between network paths.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use crate::handshake::Metadata;

/// A duplex byte connection established by one dial.
pub trait TransportConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TransportConnection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn TransportConnection>;

/// The network path a `Reconnector` dials over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialStrategy {
    /// Direct path over the overlay network.
    DirectOverlay,
    /// Default path relayed through the mesh.
    MeshRelay,
}

impl fmt::Display for DialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialStrategy::DirectOverlay => write!(f, "direct-overlay"),
            DialStrategy::MeshRelay => write!(f, "mesh-relay"),
        }
    }
}

/// A dial request: target URL plus handshake metadata.
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub url: Url,
    pub metadata: Metadata,
}

/// The peer's answer to a dial.
///
/// `conn` is present only for successful upgrades.
pub struct DialResponse {
    pub status: u16,
    pub metadata: Metadata,
    pub conn: Option<BoxedConnection>,
}

impl DialResponse {
    pub fn upgraded(metadata: Metadata, conn: BoxedConnection) -> Self {
        Self {
            status: crate::handshake::STATUS_SWITCHING_PROTOCOLS,
            metadata,
            conn: Some(conn),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            metadata: Metadata::new(),
            conn: None,
        }
    }
}

impl fmt::Debug for DialResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialResponse")
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .field("conn", &self.conn.is_some())
            .finish()
    }
}

/// Opens transport connections. Implemented by the websocket / mesh layer.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Perform one dial. Network failures are `Err`; any HTTP-level answer,
    /// including rejections, is `Ok` with its status.
    async fn dial(&self, request: DialRequest) -> io::Result<DialResponse>;
}

/// Reports whether the fast direct path is usable right now.
#[async_trait]
pub trait PathProbe: Send + Sync {
    async fn direct_path_available(&self) -> bool;
}

//! Remote stream resources and the URLs that address them.
//!
//! Each immortal stream is backed by a resource on the agent side that owns
//! the forwarded port. A `StreamRegistry` creates, lists and deletes those
//! resources; `StreamTarget` builds the dial URL for one of them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Default cap on concurrently registered streams.
pub const DEFAULT_MAX_STREAMS: usize = 32;

/// Path segment under which stream resources live.
const STREAMS_PATH: &str = "immortal-streams";

/// Identifier of a remote stream resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Metadata about one remote stream resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub name: String,
    /// Local port on the agent the stream forwards to.
    pub port: u16,
    pub created_at: SystemTime,
    pub last_connected_at: Option<SystemTime>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stream {0} not found")]
    NotFound(StreamId),

    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("too many streams (max {0})")]
    LimitReached(usize),

    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Lifecycle operations on remote stream resources.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    async fn create(&self, port: u16) -> Result<StreamInfo, RegistryError>;
    async fn list(&self) -> Result<Vec<StreamInfo>, RegistryError>;
    async fn delete(&self, id: StreamId) -> Result<(), RegistryError>;
}

/// In-process registry, used by agents that host streams in memory and by
/// tests.
pub struct MemoryRegistry {
    streams: RwLock<HashMap<StreamId, StreamInfo>>,
    max_streams: usize,
}

impl MemoryRegistry {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            max_streams,
        }
    }

    pub fn get(&self, id: StreamId) -> Option<StreamInfo> {
        self.streams.read().get(&id).cloned()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.read().contains_key(&id)
    }

    /// Record a successful dial against `id`.
    pub fn mark_connected(&self, id: StreamId) -> Result<(), RegistryError> {
        let mut streams = self.streams.write();
        let info = streams.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        info.last_connected_at = Some(SystemTime::now());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS)
    }
}

#[async_trait]
impl StreamRegistry for MemoryRegistry {
    async fn create(&self, port: u16) -> Result<StreamInfo, RegistryError> {
        if port == 0 {
            return Err(RegistryError::InvalidPort(port));
        }
        let mut streams = self.streams.write();
        if streams.len() >= self.max_streams {
            return Err(RegistryError::LimitReached(self.max_streams));
        }
        let id = StreamId::new();
        let info = StreamInfo {
            id,
            name: format!("port-{port}-{}", &id.0.simple().to_string()[..8]),
            port,
            created_at: SystemTime::now(),
            last_connected_at: None,
        };
        streams.insert(id, info.clone());
        tracing::debug!(%id, port, "stream registered");
        Ok(info)
    }

    async fn list(&self) -> Result<Vec<StreamInfo>, RegistryError> {
        let mut all: Vec<StreamInfo> = self.streams.read().values().cloned().collect();
        all.sort_by_key(|info| info.created_at);
        Ok(all)
    }

    async fn delete(&self, id: StreamId) -> Result<(), RegistryError> {
        match self.streams.write().remove(&id) {
            Some(_) => {
                tracing::debug!(%id, "stream deleted");
                Ok(())
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }
}

/// Builds dial URLs for stream resources under one agent base URL.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    base: Url,
}

impl StreamTarget {
    /// `base` should end with `/` so joining keeps its path.
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL of the stream resource `id`, e.g. `<base>immortal-streams/<id>`.
    pub fn stream_url(&self, id: StreamId) -> Result<Url, url::ParseError> {
        self.base.join(&format!("{STREAMS_PATH}/{id}"))
    }
}

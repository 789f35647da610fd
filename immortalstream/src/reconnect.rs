//! Dial strategy selection and the sequence-number handshake.
//!
//! A `Reconnector` probes the network once, when it is built, and keeps the
//! chosen dialer for its whole life. Every `reconnect` call then performs one
//! bounded dial, sends the local reader sequence and returns the peer's.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::config::ReconnectorConfig;
use crate::error::{Result, StreamError};
use crate::handshake;
use crate::signal::{FailureListener, FailureSignal, PermanentFailure};
use crate::transport::{BoxedConnection, DialRequest, DialStrategy, Dialer, PathProbe};

/// A fresh transport plus the peer's reader sequence for our write direction.
pub struct Reconnected {
    pub conn: BoxedConnection,
    pub remote_reader_seq: u64,
}

impl fmt::Debug for Reconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnected")
            .field("remote_reader_seq", &self.remote_reader_seq)
            .finish_non_exhaustive()
    }
}

/// Produces a new transport for a stream, resuming at `reader_seq`.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self, reader_seq: u64) -> Result<Reconnected>;

    /// One-shot signal fired when reconnecting becomes futile.
    fn failure_listener(&self) -> Option<FailureListener> {
        None
    }
}

/// The production `Reconnect` implementation.
pub struct Reconnector {
    url: Url,
    strategy: DialStrategy,
    dialer: Arc<dyn Dialer>,
    config: ReconnectorConfig,
    failure: FailureSignal,
}

impl Reconnector {
    /// Probe the network once and bind to the chosen path.
    pub async fn new(
        url: Url,
        probe: &dyn PathProbe,
        direct: Arc<dyn Dialer>,
        relay: Arc<dyn Dialer>,
        config: ReconnectorConfig,
    ) -> Self {
        let (strategy, dialer) = if probe.direct_path_available().await {
            (DialStrategy::DirectOverlay, direct)
        } else {
            (DialStrategy::MeshRelay, relay)
        };
        tracing::debug!(%url, %strategy, "selected dial strategy");
        Self::with_strategy(url, strategy, dialer, config)
    }

    /// Bind to an already chosen path without probing.
    pub fn with_strategy(
        url: Url,
        strategy: DialStrategy,
        dialer: Arc<dyn Dialer>,
        config: ReconnectorConfig,
    ) -> Self {
        Self {
            url,
            strategy,
            dialer,
            config,
            failure: FailureSignal::new(),
        }
    }

    pub fn strategy(&self) -> DialStrategy {
        self.strategy
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn dial_once(&self, reader_seq: u64) -> Result<Reconnected> {
        let request = DialRequest {
            url: self.url.clone(),
            metadata: handshake::request_metadata(reader_seq),
        };
        let response = tokio::time::timeout(self.config.dial_timeout, self.dialer.dial(request))
            .await
            .map_err(|_| StreamError::DialTimeout(self.config.dial_timeout))??;

        if handshake::is_permanent_status(response.status) {
            return Err(StreamError::StreamGone {
                status: response.status,
            });
        }
        if !handshake::is_success(response.status) {
            return Err(StreamError::DialRejected {
                status: response.status,
                message: "unexpected dial status".into(),
            });
        }

        let remote_reader_seq = handshake::sequence_num(&response.metadata)?;
        let conn = response.conn.ok_or_else(|| {
            StreamError::Handshake("upgrade succeeded without a connection".into())
        })?;
        Ok(Reconnected {
            conn,
            remote_reader_seq,
        })
    }
}

#[async_trait]
impl Reconnect for Reconnector {
    async fn reconnect(&self, reader_seq: u64) -> Result<Reconnected> {
        match self.dial_once(reader_seq).await {
            Ok(reconnected) => {
                tracing::debug!(
                    strategy = %self.strategy,
                    reader_seq,
                    remote_reader_seq = reconnected.remote_reader_seq,
                    "dial succeeded"
                );
                Ok(reconnected)
            }
            Err(StreamError::StreamGone { status }) => {
                tracing::error!(url = %self.url, status, "remote stream is gone");
                self.failure.fire(PermanentFailure {
                    status,
                    message: format!("{} answered {status}", self.url),
                });
                Err(StreamError::StreamGone { status })
            }
            Err(err) => {
                tracing::debug!(strategy = %self.strategy, error = %err, "dial failed");
                Err(err)
            }
        }
    }

    fn failure_listener(&self) -> Option<FailureListener> {
        Some(self.failure.listen())
    }
}

impl fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnector")
            .field("url", &self.url.as_str())
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .field("failed", &self.failure.is_fired())
            .finish()
    }
}

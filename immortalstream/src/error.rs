use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a stream reached `PermanentlyClosed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the owner.
    Requested,
    /// The peer reported that the remote stream resource no longer exists.
    StreamGone { status: u16 },
    /// The peer asked for bytes that have already been evicted from the
    /// replay buffer.
    ReplayGap { requested: u64, oldest: u64 },
    /// The peer claims to have read bytes that were never written.
    SequenceAhead { reported: u64, written: u64 },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed by owner"),
            CloseReason::StreamGone { status } => {
                write!(f, "remote stream is gone (status {status})")
            }
            CloseReason::ReplayGap { requested, oldest } => write!(
                f,
                "peer resumed at offset {requested} but oldest retained byte is {oldest}"
            ),
            CloseReason::SequenceAhead { reported, written } => write!(
                f,
                "peer reported offset {reported} beyond write offset {written}"
            ),
        }
    }
}

/// Coarse classification callers use to decide whether to wait or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Will self-heal; the supervisor retries.
    Transient,
    /// Reconnecting is futile; the stream is being closed.
    Permanent,
    /// The stream is permanently closed; create a new one.
    Closed,
}

/// All errors produced by the immortal stream layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is closed: {0}")]
    Closed(CloseReason),

    #[error("stream is already connected")]
    AlreadyConnected,

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("dial rejected with status {status}: {message}")]
    DialRejected { status: u16, message: String },

    #[error("remote stream is gone (status {status})")]
    StreamGone { status: u16 },

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StreamError::Closed(_) => ErrorClass::Closed,
            StreamError::StreamGone { .. } => ErrorClass::Permanent,
            StreamError::AlreadyConnected
            | StreamError::DialTimeout(_)
            | StreamError::DialRejected { .. }
            | StreamError::Handshake(_)
            | StreamError::Io(_) => ErrorClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }

    /// The EOF-class error: the stream will never carry data again.
    pub fn is_closed(&self) -> bool {
        self.class() == ErrorClass::Closed
    }

    /// The close reason a permanent failure maps to.
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        match self {
            StreamError::Closed(reason) => Some(reason.clone()),
            StreamError::StreamGone { status } => {
                Some(CloseReason::StreamGone { status: *status })
            }
            _ => None,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::Closed(CloseReason::Requested) => io::ErrorKind::BrokenPipe,
            StreamError::Closed(_) | StreamError::StreamGone { .. } => {
                io::ErrorKind::ConnectionAborted
            }
            StreamError::DialTimeout(_) => io::ErrorKind::TimedOut,
            StreamError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        match err {
            StreamError::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

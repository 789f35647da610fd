//! Dial handshake wire contract.
//!
//! A (re)connect is an HTTP-style upgrade. The request carries the local
//! reader sequence and an upgrade token that marks it as a stream resume;
//! the response carries the peer's reader sequence.
//!
//! ```text
//! request:  Upgrade: immortal-stream
//!           ImmortalStreamSequenceNum: <local reader seq>
//! response: 101 Switching Protocols
//!           ImmortalStreamSequenceNum: <peer reader seq>
//! ```
//!
//! 404 and 410 mean the stream no longer exists on the agent.

use std::collections::BTreeMap;

use crate::error::{Result, StreamError};

/// Header carrying a reader sequence number in both directions.
pub const SEQUENCE_NUM_HEADER: &str = "ImmortalStreamSequenceNum";
/// Upgrade header name.
pub const UPGRADE_HEADER: &str = "Upgrade";
/// Upgrade token identifying an immortal-stream dial.
pub const UPGRADE_PROTOCOL: &str = "immortal-stream";

pub const STATUS_SWITCHING_PROTOCOLS: u16 = 101;
pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_GONE: u16 = 410;

/// Header-style metadata attached to dial requests and responses.
///
/// Names compare case-insensitively, values are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the request metadata for a dial that resumes at `reader_seq`.
pub fn request_metadata(reader_seq: u64) -> Metadata {
    let mut md = Metadata::new();
    md.insert(UPGRADE_HEADER, UPGRADE_PROTOCOL);
    md.insert(SEQUENCE_NUM_HEADER, reader_seq.to_string());
    md
}

/// Whether request metadata identifies an immortal-stream dial.
pub fn is_stream_upgrade(md: &Metadata) -> bool {
    md.get(UPGRADE_HEADER)
        .is_some_and(|v| v.eq_ignore_ascii_case(UPGRADE_PROTOCOL))
}

/// Parse the sequence number header.
pub fn sequence_num(md: &Metadata) -> Result<u64> {
    let raw = md
        .get(SEQUENCE_NUM_HEADER)
        .ok_or_else(|| StreamError::Handshake(format!("missing {SEQUENCE_NUM_HEADER} header")))?;
    raw.trim().parse::<u64>().map_err(|e| {
        StreamError::Handshake(format!("invalid {SEQUENCE_NUM_HEADER} value {raw:?}: {e}"))
    })
}

pub fn is_success(status: u16) -> bool {
    status == STATUS_SWITCHING_PROTOCOLS || status == STATUS_OK
}

/// Statuses that mean reconnecting can never succeed.
pub fn is_permanent_status(status: u16) -> bool {
    status == STATUS_NOT_FOUND || status == STATUS_GONE
}

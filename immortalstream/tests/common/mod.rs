//! Shared test fixtures: an in-memory agent that serves immortal stream
//! dials over `tokio::io::duplex` pipes.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use url::Url;

use immortalstream::handshake::{self, Metadata};
use immortalstream::{
    DialRequest, DialResponse, DialStrategy, Dialer, ReconnectorConfig, Reconnector,
    ReliableStream, StreamConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn target() -> Url {
    Url::parse("http://agent.test/api/v2/immortal-streams/5f0c2a51").unwrap()
}

/// Connect a stream to `agent` over a relay-strategy reconnector.
pub async fn connect_stream(
    agent: &Arc<FakeAgent>,
    config: StreamConfig,
) -> (ReliableStream, Arc<Reconnector>) {
    let reconnector = Arc::new(Reconnector::with_strategy(
        target(),
        DialStrategy::MeshRelay,
        agent.clone(),
        ReconnectorConfig::default(),
    ));
    let stream = ReliableStream::new(reconnector.clone(), config);
    stream.connect().await.unwrap();
    (stream, reconnector)
}

#[derive(Default)]
struct Control {
    deleted: bool,
    dials: usize,
    requested_seqs: Vec<u64>,
    reader_task: Option<JoinHandle<()>>,
}

/// Agent side of a stream. Records every byte it receives, in order, and
/// answers each dial with how many bytes it has received so far.
///
/// Bytes still in flight when a connection is replaced are lost, as on a
/// real dropped link.
pub struct FakeAgent {
    control: Mutex<Control>,
    received: Arc<Mutex<Vec<u8>>>,
    progress: Arc<watch::Sender<usize>>,
    writer: AsyncMutex<Option<WriteHalf<DuplexStream>>>,
    pipe_capacity: usize,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Self::with_pipe_capacity(64 * 1024)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Arc<Self> {
        let (progress, _) = watch::channel(0);
        Arc::new(Self {
            control: Mutex::new(Control::default()),
            received: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::new(progress),
            writer: AsyncMutex::new(None),
            pipe_capacity,
        })
    }

    /// Make every later dial answer 404.
    pub fn delete(&self) {
        self.control.lock().deleted = true;
    }

    pub fn dials(&self) -> usize {
        self.control.lock().dials
    }

    /// Reader sequence the client sent on each successful dial.
    pub fn requested_seqs(&self) -> Vec<u64> {
        self.control.lock().requested_seqs.clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub async fn wait_received(&self, len: usize) {
        let mut rx = self.progress.subscribe();
        let _ = rx.wait_for(|n| *n >= len).await;
    }

    /// Kill the current connection from the agent side.
    pub async fn drop_connection(&self) {
        let task = self.control.lock().reader_task.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.writer.lock().await.take();
    }

    /// Send bytes to the client on the current connection.
    pub async fn send_to_client(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let half = writer
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        half.write_all(bytes).await?;
        half.flush().await
    }
}

#[async_trait]
impl Dialer for FakeAgent {
    async fn dial(&self, request: DialRequest) -> io::Result<DialResponse> {
        let previous = {
            let mut control = self.control.lock();
            control.dials += 1;
            if control.deleted {
                return Ok(DialResponse::status(handshake::STATUS_NOT_FOUND));
            }
            control.reader_task.take()
        };
        if let Some(task) = previous {
            task.abort();
            let _ = task.await;
        }

        if !handshake::is_stream_upgrade(&request.metadata) {
            return Ok(DialResponse::status(400));
        }
        let client_seq = handshake::sequence_num(&request.metadata).map_err(io::Error::from)?;

        let (client, agent) = tokio::io::duplex(self.pipe_capacity);
        let (mut rd, wr) = tokio::io::split(agent);
        let our_seq = self.received.lock().len() as u64;

        let received = self.received.clone();
        let progress = self.progress.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut received = received.lock();
                        received.extend_from_slice(&buf[..n]);
                        progress.send_replace(received.len());
                    }
                }
            }
        });

        *self.writer.lock().await = Some(wr);
        {
            let mut control = self.control.lock();
            control.requested_seqs.push(client_seq);
            control.reader_task = Some(task);
        }

        let mut md = Metadata::new();
        md.insert(handshake::SEQUENCE_NUM_HEADER, our_seq.to_string());
        Ok(DialResponse::upgraded(md, Box::new(client)))
    }
}

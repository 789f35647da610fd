//! ReliableStream behaviour across transport drops: replay, resume offsets,
//! ordering under concurrency and the terminal closed state.

mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use immortalstream::{
    CloseReason, Reconnect, Reconnected, ReliableStream, Result, StreamConfig, StreamError,
    StreamState,
};

use common::{connect_stream, init_tracing, FakeAgent};

/// Serves queued pipes with a chosen peer reader sequence.
#[derive(Default)]
struct Pipes {
    queue: Mutex<VecDeque<(DuplexStream, u64)>>,
}

impl Pipes {
    fn push(&self, remote_seq: u64) -> DuplexStream {
        self.push_sized(1024, remote_seq)
    }

    /// A pipe that holds at most `capacity` unread bytes per direction.
    fn push_sized(&self, capacity: usize, remote_seq: u64) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(capacity);
        self.queue.lock().push_back((ours, remote_seq));
        theirs
    }
}

#[async_trait]
impl Reconnect for Pipes {
    async fn reconnect(&self, _reader_seq: u64) -> Result<Reconnected> {
        let next = self.queue.lock().pop_front();
        let (conn, remote_reader_seq) =
            next.ok_or_else(|| StreamError::Io(io::ErrorKind::ConnectionRefused.into()))?;
        Ok(Reconnected {
            conn: Box::new(conn),
            remote_reader_seq,
        })
    }
}

/// Accepts a dial and never answers it.
#[derive(Default)]
struct Unanswered {
    dialing: Notify,
}

#[async_trait]
impl Reconnect for Unanswered {
    async fn reconnect(&self, _reader_seq: u64) -> Result<Reconnected> {
        self.dialing.notify_one();
        std::future::pending().await
    }
}

async fn pipe_stream(pipes: &Arc<Pipes>, capacity: usize) -> ReliableStream {
    let stream = ReliableStream::new(
        pipes.clone(),
        StreamConfig::default().with_replay_capacity(capacity),
    );
    stream.connect().await.unwrap();
    stream
}

/// Nothing else arrives on `peer` within a short grace period.
async fn assert_silent(peer: &mut DuplexStream) {
    let mut extra = [0u8; 1];
    let res = tokio::time::timeout(Duration::from_millis(50), peer.read(&mut extra)).await;
    assert!(res.is_err(), "unexpected bytes after replay");
}

// ---------------------------------------------------------------------------
// Replay after drops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unacknowledged_write_is_delivered_once() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let first = pipes.push(0);
    let stream = pipe_stream(&pipes, 1024).await;

    stream.write(b"hello").await.unwrap();
    // The peer dies before reading anything.
    drop(first);

    let mut second = pipes.push(0);
    stream.force_reconnect().await.unwrap();

    let mut got = [0u8; 5];
    second.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"hello");
    assert_silent(&mut second).await;
}

#[tokio::test]
async fn replay_starts_at_peer_offset() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let mut first = pipes.push(0);
    let stream = pipe_stream(&pipes, 1024).await;

    stream.write(b"AB").await.unwrap();
    let mut got = [0u8; 2];
    first.read_exact(&mut got).await.unwrap();
    drop(first);

    // The peer only consumed "A" before the link died.
    let mut second = pipes.push(1);
    stream.force_reconnect().await.unwrap();
    stream.write(b"CD").await.unwrap();

    let mut got = [0u8; 3];
    second.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"BCD");
    assert_silent(&mut second).await;
}

#[tokio::test]
async fn acknowledged_bytes_are_not_resent() {
    init_tracing();
    let agent = FakeAgent::new();
    let (stream, _) = connect_stream(&agent, StreamConfig::default()).await;

    stream.write(b"hello").await.unwrap();
    agent.wait_received(5).await;
    agent.drop_connection().await;
    stream.force_reconnect().await.unwrap();
    stream.write(b" world").await.unwrap();

    agent.wait_received(11).await;
    assert_eq!(agent.received(), b"hello world");
    assert_eq!(agent.dials(), 2);
}

#[tokio::test]
async fn random_drops_lose_and_duplicate_nothing() {
    init_tracing();
    let agent = FakeAgent::with_pipe_capacity(4096);
    let (stream, _) = connect_stream(&agent, StreamConfig::default()).await;

    let mut sent = Vec::new();
    for round in 0..60 {
        let len = (rand::random::<u32>() % 700) as usize + 1;
        let chunk: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
        stream.write(&chunk).await.unwrap();
        sent.extend_from_slice(&chunk);

        if rand::random::<u32>() % 4 == 0 {
            agent.drop_connection().await;
            stream.force_reconnect().await.unwrap();
        }
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    stream.flush().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.wait_received(sent.len()))
        .await
        .unwrap();
    assert_eq!(agent.received(), sent);
    assert_eq!(stream.write_offset(), sent.len() as u64);
}

#[tokio::test]
async fn reconnect_reports_bytes_read() {
    init_tracing();
    let agent = FakeAgent::new();
    let (stream, _) = connect_stream(&agent, StreamConfig::default()).await;

    agent.send_to_client(b"xyz").await.unwrap();
    let mut buf = [0u8; 3];
    let mut read = 0;
    while read < 3 {
        read += stream.read(&mut buf[read..]).await.unwrap();
    }
    assert_eq!(&buf, b"xyz");

    stream.force_reconnect().await.unwrap();
    assert_eq!(agent.requested_seqs(), vec![0, 3]);
    assert_eq!(stream.reader_seq(), 3);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_keep_their_order_across_reconnects() {
    init_tracing();
    let agent = FakeAgent::new();
    let (stream, _) = connect_stream(&agent, StreamConfig::default()).await;

    const CHUNKS: usize = 200;
    let writer = |base: u8| {
        let stream = stream.clone();
        tokio::spawn(async move {
            for i in 0..CHUNKS {
                let value = base + (i % 100) as u8;
                stream.write(&[value; 8]).await.unwrap();
            }
        })
    };
    let low = writer(0);
    let high = writer(128);

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        agent.drop_connection().await;
        stream.force_reconnect().await.unwrap();
    }
    low.await.unwrap();
    high.await.unwrap();

    stream.flush().await.unwrap();
    let total = 2 * CHUNKS * 8;
    tokio::time::timeout(Duration::from_secs(5), agent.wait_received(total))
        .await
        .unwrap();

    let received = agent.received();
    assert_eq!(received.len(), total);
    for base in [0u8, 128] {
        let expected: Vec<u8> = (0..CHUNKS)
            .flat_map(|i| [base + (i % 100) as u8; 8])
            .collect();
        let got: Vec<u8> = received
            .iter()
            .copied()
            .filter(|b| (*b >= 128) == (base == 128))
            .collect();
        assert_eq!(got, expected, "writer {base} reordered or lost bytes");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_is_idempotent() {
    let pipes = Arc::new(Pipes::default());
    let _peer = pipes.push(0);
    let stream = pipe_stream(&pipes, 64).await;

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let stream = stream.clone();
            tokio::spawn(async move { stream.close() })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap().unwrap();
    }

    assert_eq!(stream.state(), StreamState::PermanentlyClosed);
    assert_eq!(stream.close_reason(), Some(CloseReason::Requested));
    let mut buf = [0u8; 1];
    assert!(stream.read(&mut buf).await.unwrap_err().is_closed());
    assert!(stream.write(b"x").await.unwrap_err().is_closed());
}

// ---------------------------------------------------------------------------
// Bounded replay window
// ---------------------------------------------------------------------------

#[tokio::test]
async fn evicted_resume_offset_closes_stream() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let mut first = pipes.push(0);
    let stream = pipe_stream(&pipes, 4).await;

    stream.write(b"abcd").await.unwrap();
    stream.write(b"efgh").await.unwrap();
    let mut got = [0u8; 8];
    first.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"abcdefgh");

    // Only "efgh" is retained; a peer resuming at 2 cannot be served.
    let _second = pipes.push(2);
    let err = stream.force_reconnect().await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(
        stream.close_reason(),
        Some(CloseReason::ReplayGap {
            requested: 2,
            oldest: 4
        })
    );
}

#[tokio::test]
async fn writes_larger_than_window_complete_once_connected() {
    let pipes = Arc::new(Pipes::default());
    let mut peer = pipes.push(0);
    let stream = pipe_stream(&pipes, 16).await;

    let payload: Vec<u8> = (0..200u8).collect();
    let reader = tokio::spawn(async move {
        let mut got = vec![0u8; 200];
        peer.read_exact(&mut got).await.unwrap();
        got
    });
    assert_eq!(stream.write(&payload).await.unwrap(), 200);
    assert_eq!(reader.await.unwrap(), payload);
}

// ---------------------------------------------------------------------------
// Stalled transports and close races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_returns_while_the_peer_is_not_reading() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let mut peer = pipes.push_sized(16, 0);
    let stream = pipe_stream(&pipes, 1024).await;

    let n = timeout(Duration::from_millis(500), stream.write(&[7u8; 100]))
        .await
        .expect("write must not wait for the peer")
        .unwrap();
    assert_eq!(n, 100);
    assert_eq!(stream.write_offset(), 100);
    assert!(stream.is_connected());

    timeout(Duration::from_millis(500), stream.write(&[8u8; 100]))
        .await
        .expect("the window still has room")
        .unwrap();

    // An explicit flush does wait until the peer drains the pipe.
    assert!(timeout(Duration::from_millis(50), stream.flush())
        .await
        .is_err());
    let mut got = vec![0u8; 200];
    let (flushed, read) = tokio::join!(stream.flush(), peer.read_exact(&mut got));
    flushed.unwrap();
    read.unwrap();
    assert_eq!(&got[..100], &[7u8; 100][..]);
    assert_eq!(&got[100..], &[8u8; 100][..]);
}

#[tokio::test]
async fn close_releases_a_stalled_transport() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let mut peer = pipes.push_sized(16, 0);
    let stream = pipe_stream(&pipes, 1024).await;

    stream.write(&[7u8; 100]).await.unwrap();
    // Let the sender fill the pipe and block on the rest.
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.close().unwrap();

    let mut got = Vec::new();
    timeout(Duration::from_secs(1), peer.read_to_end(&mut got))
        .await
        .expect("peer should see EOF after close")
        .unwrap();
    assert_eq!(got, vec![7u8; 16]);
}

#[tokio::test]
async fn close_wakes_a_writer_waiting_for_room() {
    init_tracing();
    let pipes = Arc::new(Pipes::default());
    let _peer = pipes.push_sized(16, 0);
    let stream = pipe_stream(&pipes, 64).await;

    // 64 bytes fill the window; the peer never reads, so only 16 leave it.
    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[1u8; 200]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished());
    assert_eq!(stream.write_offset(), 64);

    stream.close().unwrap();
    let err = timeout(Duration::from_secs(1), writer)
        .await
        .expect("close should wake the writer")
        .unwrap()
        .unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn close_during_a_dial_fails_the_dial() {
    init_tracing();
    let dialer = Arc::new(Unanswered::default());
    let stream = ReliableStream::new(dialer.clone(), StreamConfig::default());

    let dial = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.force_reconnect().await })
    };
    dialer.dialing.notified().await;
    assert_eq!(stream.state(), StreamState::Connecting);

    stream.close().unwrap();
    let err = timeout(Duration::from_secs(1), dial)
        .await
        .expect("close should cancel the pending dial")
        .unwrap()
        .unwrap_err();
    assert!(err.is_closed());
    assert_eq!(stream.state(), StreamState::PermanentlyClosed);
    assert_eq!(stream.close_reason(), Some(CloseReason::Requested));
    assert!(stream.force_reconnect().await.unwrap_err().is_closed());
}

//! The reliable reconnecting byte stream.
//!
//! A `ReliableStream` looks like one long-lived connection while the
//! transport underneath is replaced whenever it fails. State machine:
//! Connecting -> Connected -> Disconnected -> Connecting -> ... ->
//! PermanentlyClosed (terminal, reachable from anywhere).
//!
//! Sequence bookkeeping, the replay window, the epoch and the state live in
//! one `parking_lot::Mutex` and are never held across an await. The read
//! half sits in an async slot tagged with the epoch that installed it. The
//! write half is owned by a sender task that drains the replay window from
//! `flushed` onward, so `write` only ever waits for window space. Every
//! state change is published on a `watch` channel, so blocked readers,
//! writers and the reconnect path wake without missed notifications.
//!
//! Lock order: dial lock, then reader slot, then `inner`.

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};

use crate::config::StreamConfig;
use crate::error::{CloseReason, Result, StreamError};
use crate::reconnect::{Reconnect, Reconnected};
use crate::replay::{ReplayBuffer, ReplayError};
use crate::transport::BoxedConnection;

/// Stream state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// A dial is in progress (or the first one has not happened yet).
    Connecting,
    /// A transport is installed and carrying data.
    Connected,
    /// The last transport failed; waiting for a reconnect.
    Disconnected,
    /// Terminal. No further transitions.
    PermanentlyClosed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Connecting => write!(f, "Connecting"),
            StreamState::Connected => write!(f, "Connected"),
            StreamState::Disconnected => write!(f, "Disconnected"),
            StreamState::PermanentlyClosed => write!(f, "PermanentlyClosed"),
        }
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub state: StreamState,
    /// Generation of the installed transport.
    pub epoch: u64,
    /// Offset up to which bytes were handed to the current transport.
    pub flushed: u64,
}

struct Inner {
    state: StreamState,
    epoch: u64,
    /// Bytes delivered to the caller through `read`.
    reader_seq: u64,
    replay: ReplayBuffer,
    /// Bytes below this offset were written to the current transport.
    /// Always within `[replay.start(), replay.end()]`.
    flushed: u64,
    close_reason: Option<CloseReason>,
    connected_once: bool,
    watching_failures: bool,
}

impl Inner {
    fn link(&self) -> Link {
        Link {
            state: self.state,
            epoch: self.epoch,
            flushed: self.flushed,
        }
    }

    fn closed_error(&self) -> Option<StreamError> {
        match self.state {
            StreamState::PermanentlyClosed => Some(StreamError::Closed(
                self.close_reason.clone().unwrap_or(CloseReason::Requested),
            )),
            _ => None,
        }
    }

    /// Bytes that can be appended without evicting anything unsent.
    fn room(&self) -> usize {
        let unsent = (self.replay.end() - self.flushed) as usize;
        self.replay.capacity().saturating_sub(unsent)
    }

    fn unsent(&self) -> Bytes {
        self.replay.slice_from(self.flushed).unwrap_or_default()
    }
}

/// A transport half together with the epoch that installed it.
struct Slot<T> {
    epoch: u64,
    half: T,
}

struct Shared {
    inner: Mutex<Inner>,
    link: watch::Sender<Link>,
    reader: AsyncMutex<Option<Slot<ReadHalf<BoxedConnection>>>>,
    /// Wakes the sender task when bytes are appended.
    appended: Arc<Notify>,
    /// Serializes dials: at most one in flight.
    dialing: AsyncMutex<()>,
    reconnector: Arc<dyn Reconnect>,
}

impl Shared {
    fn transition(&self, inner: &mut Inner, state: StreamState) {
        if inner.state != state {
            tracing::debug!(from = %inner.state, to = %state, epoch = inner.epoch, "stream state");
        }
        inner.state = state;
        if state != StreamState::Connected {
            // Without a live transport nothing counts as sent; this keeps
            // writers from evicting bytes the next transport must replay.
            inner.flushed = inner.replay.start();
        }
        self.link.send_replace(inner.link());
    }

    fn closed_error(&self) -> StreamError {
        self.inner
            .lock()
            .closed_error()
            .unwrap_or(StreamError::Closed(CloseReason::Requested))
    }

    fn check_open(&self) -> Result<()> {
        match self.inner.lock().closed_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Move to `PermanentlyClosed`. Returns `false` if already closed.
    fn close_with(&self, reason: CloseReason) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::PermanentlyClosed {
                return false;
            }
            match reason {
                CloseReason::Requested => tracing::debug!(epoch = inner.epoch, "stream closed"),
                ref other => tracing::error!(epoch = inner.epoch, reason = %other, "stream closed"),
            }
            inner.close_reason = Some(reason);
            self.transition(&mut inner, StreamState::PermanentlyClosed);
        }
        self.release_transport();
        true
    }

    /// Drop the read half unless a reader holds it; that reader takes it out
    /// of the slot once it sees the close. The sender task owns the write
    /// half and drops it on the same transition.
    fn release_transport(&self) {
        if let Ok(mut slot) = self.reader.try_lock() {
            slot.take();
        }
    }

    /// Record that the transport of `epoch` failed.
    fn mark_disconnected(&self, epoch: u64, cause: &dyn fmt::Display) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.state == StreamState::Connected {
            tracing::debug!(epoch, reader_seq = inner.reader_seq, cause = %cause, "transport lost");
            self.transition(&mut inner, StreamState::Disconnected);
        }
    }

    /// Leave `Connecting` after a failed dial, unless something else moved on.
    fn abandon_dial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == StreamState::Connecting {
            self.transition(&mut inner, StreamState::Disconnected);
        }
    }

    /// Close after an inconsistent resume offset.
    fn replay_failed(&self, err: ReplayError) -> StreamError {
        let reason = match err {
            ReplayError::Evicted { requested, oldest } => {
                CloseReason::ReplayGap { requested, oldest }
            }
            ReplayError::Ahead { requested, end } => CloseReason::SequenceAhead {
                reported: requested,
                written: end,
            },
        };
        self.close_with(reason);
        self.closed_error()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<Link>) {
    let _ = rx
        .wait_for(|l| l.state == StreamState::PermanentlyClosed)
        .await;
}

/// Resolves once the transport of `epoch` is no longer the live one.
async fn wait_superseded(rx: &mut watch::Receiver<Link>, epoch: u64) {
    let _ = rx
        .wait_for(|l| l.epoch != epoch || l.state != StreamState::Connected)
        .await;
}

async fn send_all(half: &mut WriteHalf<BoxedConnection>, bytes: &[u8]) -> io::Result<()> {
    half.write_all(bytes).await?;
    half.flush().await
}

/// Sender task for the transport installed at `epoch`.
///
/// Hands `[flushed, end)` to the transport and publishes progress. Exits,
/// dropping the write half, once that transport is superseded, the stream
/// closes or every handle is gone.
async fn drain(
    shared: Weak<Shared>,
    appended: Arc<Notify>,
    mut link_rx: watch::Receiver<Link>,
    epoch: u64,
    mut half: WriteHalf<BoxedConnection>,
) {
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        let (from, pending) = {
            let inner = strong.inner.lock();
            if inner.epoch != epoch || inner.state != StreamState::Connected {
                return;
            }
            (inner.flushed, inner.unsent())
        };
        drop(strong);

        if pending.is_empty() {
            tokio::select! {
                _ = appended.notified() => continue,
                _ = wait_superseded(&mut link_rx, epoch) => return,
            }
        }
        let res = tokio::select! {
            res = send_all(&mut half, &pending) => res,
            _ = wait_superseded(&mut link_rx, epoch) => return,
        };

        let Some(strong) = shared.upgrade() else {
            return;
        };
        match res {
            Ok(()) => {
                let mut inner = strong.inner.lock();
                if inner.epoch == epoch && inner.state == StreamState::Connected {
                    inner.flushed = inner.flushed.max(from + pending.len() as u64);
                    strong.link.send_replace(inner.link());
                }
            }
            Err(err) => {
                strong.mark_disconnected(epoch, &err);
                return;
            }
        }
    }
}

/// A byte stream that survives transport failures without losing or
/// duplicating data.
///
/// Handles are cheap to clone; all clones drive the same stream.
#[derive(Clone)]
pub struct ReliableStream {
    shared: Arc<Shared>,
}

impl ReliableStream {
    pub fn new(reconnector: Arc<dyn Reconnect>, config: StreamConfig) -> Self {
        let inner = Inner {
            state: StreamState::Connecting,
            epoch: 0,
            reader_seq: 0,
            replay: ReplayBuffer::new(config.replay_capacity),
            flushed: 0,
            close_reason: None,
            connected_once: false,
            watching_failures: false,
        };
        let (link, _) = watch::channel(inner.link());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                link,
                reader: AsyncMutex::new(None),
                appended: Arc::new(Notify::new()),
                dialing: AsyncMutex::new(()),
                reconnector,
            }),
        }
    }

    /// Perform the first dial. Failures are returned, not retried.
    pub async fn connect(&self) -> Result<()> {
        self.watch_failures();
        self.reestablish(true).await
    }

    /// Tear down the current transport (if any) and dial once.
    ///
    /// Returns `StreamError::Closed` once the stream is permanently closed;
    /// any other error is transient.
    pub async fn force_reconnect(&self) -> Result<()> {
        self.reestablish(false).await
    }

    /// Read into `buf`, waiting across reconnects.
    ///
    /// Intended for a single reader; concurrent calls are serialized.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let shared = &self.shared;
        let mut link_rx = shared.link.subscribe();
        loop {
            let link = *link_rx.borrow_and_update();
            match link.state {
                StreamState::PermanentlyClosed => {
                    shared.release_transport();
                    return Err(shared.closed_error());
                }
                StreamState::Connected => {}
                StreamState::Connecting | StreamState::Disconnected => {
                    if link_rx.changed().await.is_err() {
                        return Err(shared.closed_error());
                    }
                    continue;
                }
            }
            if buf.is_empty() {
                return Ok(0);
            }

            let mut slot = tokio::select! {
                guard = shared.reader.lock() => guard,
                _ = wait_superseded(&mut link_rx, link.epoch) => continue,
            };
            let outcome = match slot.as_mut() {
                Some(current) if current.epoch == link.epoch => {
                    tokio::select! {
                        res = current.half.read(buf) => Some(res),
                        _ = wait_superseded(&mut link_rx, link.epoch) => None,
                    }
                }
                _ => None,
            };
            let Some(res) = outcome else {
                if shared.inner.lock().state == StreamState::PermanentlyClosed {
                    slot.take();
                }
                drop(slot);
                wait_superseded(&mut link_rx, link.epoch).await;
                continue;
            };

            match res {
                Ok(0) => {
                    shared.mark_disconnected(link.epoch, &"transport closed by peer");
                    slot.take();
                }
                Err(err) => {
                    shared.mark_disconnected(link.epoch, &err);
                    slot.take();
                }
                Ok(n) => {
                    let mut inner = shared.inner.lock();
                    if let Some(err) = inner.closed_error() {
                        return Err(err);
                    }
                    inner.reader_seq += n as u64;
                    return Ok(n);
                }
            }
        }
    }

    /// Buffer `buf` for delivery.
    ///
    /// Returns once every byte is in the replay window; the sender task
    /// hands them to the transport. Waits only when the window is full of
    /// bytes no transport has taken yet, so a stalled peer never blocks a
    /// write that fits.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            self.shared.check_open()?;
            return Ok(0);
        }
        let mut accepted = 0;
        while accepted < buf.len() {
            let n = self.enqueue(&buf[accepted..])?;
            if n == 0 {
                self.writable().await?;
                continue;
            }
            accepted += n;
        }
        Ok(accepted)
    }

    /// Wait until `enqueue` can accept at least one byte.
    pub async fn writable(&self) -> Result<()> {
        let mut link_rx = self.shared.link.subscribe();
        loop {
            link_rx.borrow_and_update();
            {
                let inner = self.shared.inner.lock();
                if let Some(err) = inner.closed_error() {
                    return Err(err);
                }
                if inner.room() > 0 {
                    return Ok(());
                }
            }
            if link_rx.changed().await.is_err() {
                return Err(self.shared.closed_error());
            }
        }
    }

    /// Append as much of `data` as fits without evicting unsent bytes.
    pub fn enqueue(&self, data: &[u8]) -> Result<usize> {
        let n = {
            let mut inner = self.shared.inner.lock();
            if let Some(err) = inner.closed_error() {
                return Err(err);
            }
            let n = inner.room().min(data.len());
            if n > 0 {
                inner.replay.append(&data[..n]);
            }
            n
        };
        if n > 0 {
            self.shared.appended.notify_one();
        }
        Ok(n)
    }

    /// Wait until everything buffered so far has been handed to the current
    /// transport.
    ///
    /// A no-op while disconnected: the bytes go out with the next replay.
    pub async fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let mut link_rx = shared.link.subscribe();
        let target = {
            let inner = shared.inner.lock();
            if let Some(err) = inner.closed_error() {
                return Err(err);
            }
            inner.replay.end()
        };
        let state = link_rx
            .wait_for(|l| l.state != StreamState::Connected || l.flushed >= target)
            .await
            .map(|l| l.state)
            .unwrap_or(StreamState::PermanentlyClosed);
        match state {
            StreamState::PermanentlyClosed => Err(shared.closed_error()),
            _ => Ok(()),
        }
    }

    /// Permanently close the stream. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.close_with(CloseReason::Requested);
        Ok(())
    }

    /// Resolves once the stream is permanently closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.link.subscribe();
        wait_closed(&mut rx).await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().state == StreamState::Connected
    }

    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::PermanentlyClosed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.inner.lock().close_reason.clone()
    }

    /// Watch state and epoch changes.
    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.shared.link.subscribe()
    }

    pub fn reader_seq(&self) -> u64 {
        self.shared.inner.lock().reader_seq
    }

    pub fn write_offset(&self) -> u64 {
        self.shared.inner.lock().replay.end()
    }

    pub fn epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    /// Close the stream when the reconnector reports a permanent failure.
    fn watch_failures(&self) {
        let Some(mut listener) = self.shared.reconnector.failure_listener() else {
            return;
        };
        {
            let mut inner = self.shared.inner.lock();
            if inner.watching_failures {
                return;
            }
            inner.watching_failures = true;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let mut link_rx = self.shared.link.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                failure = listener.fired() => {
                    if let (Some(failure), Some(shared)) = (failure, weak.upgrade()) {
                        shared.close_with(CloseReason::StreamGone { status: failure.status });
                    }
                }
                _ = wait_closed(&mut link_rx) => {}
            }
        });
    }

    async fn reestablish(&self, initial: bool) -> Result<()> {
        let shared = &self.shared;
        let mut link_rx = shared.link.subscribe();

        let _dialing = tokio::select! {
            guard = shared.dialing.lock() => guard,
            _ = wait_closed(&mut link_rx) => return Err(shared.closed_error()),
        };
        {
            let mut inner = shared.inner.lock();
            if let Some(err) = inner.closed_error() {
                return Err(err);
            }
            if initial && inner.connected_once {
                return Err(StreamError::AlreadyConnected);
            }
            shared.transition(&mut inner, StreamState::Connecting);
        }

        // The old sender task exits on the transition above; a blocked
        // reader lets go of its half.
        let mut reader = tokio::select! {
            guard = shared.reader.lock() => guard,
            _ = wait_closed(&mut link_rx) => return Err(shared.closed_error()),
        };
        reader.take();

        // The reader slot is held, so this cannot move until we are done.
        let reader_seq = shared.inner.lock().reader_seq;
        tracing::debug!(reader_seq, initial, "dialing");
        let dialed = tokio::select! {
            res = shared.reconnector.reconnect(reader_seq) => res,
            _ = wait_closed(&mut link_rx) => return Err(shared.closed_error()),
        };
        let Reconnected {
            conn,
            remote_reader_seq,
        } = match dialed {
            Ok(reconnected) => reconnected,
            Err(err) => {
                if let Some(reason) = err.close_reason() {
                    shared.close_with(reason);
                    return Err(shared.closed_error());
                }
                shared.abandon_dial();
                return Err(err);
            }
        };

        // Rebase the window on the peer's confirmed offset and go live. The
        // sender task starts at `flushed`, so the backlog is replayed ahead
        // of anything written later.
        let rebased = {
            let mut inner = shared.inner.lock();
            if let Some(err) = inner.closed_error() {
                return Err(err);
            }
            match inner.replay.acknowledge(remote_reader_seq) {
                Ok(()) => {
                    inner.flushed = remote_reader_seq;
                    inner.epoch += 1;
                    inner.connected_once = true;
                    shared.transition(&mut inner, StreamState::Connected);
                    Ok((inner.epoch, inner.replay.end() - remote_reader_seq))
                }
                Err(err) => Err(err),
            }
        };
        let (epoch, backlog) = match rebased {
            Ok(rebased) => rebased,
            Err(err) => return Err(shared.replay_failed(err)),
        };
        if backlog > 0 {
            tracing::debug!(
                from = remote_reader_seq,
                bytes = backlog,
                "replaying unacknowledged bytes"
            );
        }

        let (read_half, write_half) = tokio::io::split(conn);
        *reader = Some(Slot {
            epoch,
            half: read_half,
        });
        tokio::spawn(drain(
            Arc::downgrade(shared),
            shared.appended.clone(),
            shared.link.subscribe(),
            epoch,
            write_half,
        ));
        tracing::info!(epoch, reader_seq, remote_reader_seq, "stream connected");
        Ok(())
    }
}

impl fmt::Debug for ReliableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ReliableStream")
            .field("state", &inner.state)
            .field("epoch", &inner.epoch)
            .field("reader_seq", &inner.reader_seq)
            .field("write_offset", &inner.replay.end())
            .finish()
    }
}

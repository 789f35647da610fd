//! `AsyncRead` / `AsyncWrite` over a `ReliableStream`, so it can be handed
//! to anything that expects a socket (for example
//! `tokio::io::copy_bidirectional` when forwarding a port).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{CloseReason, Result, StreamError};
use crate::stream::ReliableStream;

const READ_CHUNK: usize = 16 * 1024;

type ReadFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;
type UnitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Socket-like view of a `ReliableStream`.
///
/// A stream closed by its owner reads as EOF; any other closure is an
/// error. `poll_shutdown` flushes and then closes the stream.
pub struct StreamIo {
    stream: ReliableStream,
    read_fut: Option<ReadFuture>,
    leftover: Bytes,
    flush_fut: Option<UnitFuture>,
    room_fut: Option<UnitFuture>,
}

impl StreamIo {
    pub fn new(stream: ReliableStream) -> Self {
        Self {
            stream,
            read_fut: None,
            leftover: Bytes::new(),
            flush_fut: None,
            room_fut: None,
        }
    }

    pub fn get_ref(&self) -> &ReliableStream {
        &self.stream
    }

    pub fn into_inner(self) -> ReliableStream {
        self.stream
    }

    fn flush_future(&self) -> UnitFuture {
        let stream = self.stream.clone();
        Box::pin(async move { stream.flush().await })
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leftover.is_empty() {
            let stream = &this.stream;
            let fut = this.read_fut.get_or_insert_with(|| {
                let stream = stream.clone();
                Box::pin(async move {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    let n = stream.read(&mut chunk).await?;
                    chunk.truncate(n);
                    Ok(Bytes::from(chunk))
                })
            });
            let res = ready!(fut.as_mut().poll(cx));
            this.read_fut = None;
            match res {
                Ok(bytes) => this.leftover = bytes,
                Err(StreamError::Closed(CloseReason::Requested)) => return Poll::Ready(Ok(())),
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }
        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.room_fut.as_mut() {
                let res = ready!(fut.as_mut().poll(cx));
                this.room_fut = None;
                res?;
            }

            // The stream's sender task moves accepted bytes to the transport;
            // a closed stream fails right here.
            let n = this.stream.enqueue(buf)?;
            if n > 0 {
                return Poll::Ready(Ok(n));
            }

            let stream = this.stream.clone();
            this.room_fut = Some(Box::pin(async move { stream.writable().await }));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.flush_fut.is_none() {
            this.flush_fut = Some(this.flush_future());
        }
        let Some(fut) = this.flush_fut.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = ready!(fut.as_mut().poll(cx));
        this.flush_fut = None;
        Poll::Ready(res.map_err(io::Error::from))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut *this).poll_flush(cx))?;
        this.stream.close()?;
        Poll::Ready(Ok(()))
    }
}

use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{ready, Context, Poll, Waker},
    time::Duration,
};

use bytes::{Buf, Bytes};
use rand::{rngs::StdRng, Rng};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};

use crate::bucket::Limiter;

/// Largest unit of data scheduled at once. Larger writes are accepted partially.
pub(crate) const MAX_SEGMENT: usize = 16 * 1024;
/// Bytes that may be waiting for release in one direction before the writer is pushed back on.
const MAX_QUEUED: usize = 256 * 1024;

/// Per-connection transfer statistics.
#[derive(Debug, Default)]
pub struct ShapedStats {
    up_bytes: AtomicUsize,
    down_bytes: AtomicUsize,
    up_dropped: AtomicUsize,
    down_dropped: AtomicUsize,
}

impl ShapedStats {
    /// Bytes delivered from the client to the reader.
    #[inline]
    pub fn up_bytes(&self) -> usize {
        self.up_bytes.load(Ordering::Relaxed)
    }

    /// Bytes delivered to the client.
    #[inline]
    pub fn down_bytes(&self) -> usize {
        self.down_bytes.load(Ordering::Relaxed)
    }

    /// Reads dropped by the loss emulation.
    #[inline]
    pub fn up_dropped(&self) -> usize {
        self.up_dropped.load(Ordering::Relaxed)
    }

    /// Writes dropped by the loss emulation.
    #[inline]
    pub fn down_dropped(&self) -> usize {
        self.down_dropped.load(Ordering::Relaxed)
    }
}

/// One direction of a shaped connection.
pub(crate) struct Lane {
    limiter: Limiter,
    delay: Duration,
    loss: f64,
    /// Data waiting for its release time, in order.
    queue: VecDeque<(Instant, Bytes)>,
    queued: usize,
    last_release: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
    /// Tasks waiting on `timer`. A `Sleep` only keeps the last waker it was polled with.
    waiters: Vec<Waker>,
}

impl Lane {
    pub(crate) fn new(limiter: Limiter, delay: Duration, loss: f64) -> Self {
        Self {
            limiter,
            delay,
            loss,
            queue: VecDeque::new(),
            queued: 0,
            last_release: None,
            timer: None,
            waiters: Vec::new(),
        }
    }

    /// No shaping at all, data can bypass the queue.
    fn is_passthrough(&self) -> bool {
        self.limiter.is_unlimited() && self.delay.is_zero() && self.loss == 0.0
    }

    fn is_lost(&self, rng: &mut StdRng) -> bool {
        self.loss > 0.0 && rng.gen::<f64>() < self.loss
    }

    /// Schedules `data` for release once it has been transmitted and has propagated. Release
    /// times never go backwards.
    fn schedule(&mut self, now: Instant, data: Bytes) {
        let transmitted = self.limiter.reserve(now, data.len());
        let mut release = transmitted + self.delay;
        if let Some(last) = self.last_release {
            release = release.max(last);
        }

        self.last_release = Some(release);
        self.queued += data.len();
        self.queue.push_back((release, data));
    }

    /// Resolves when the front of the queue is due. `None` if the queue is empty.
    fn poll_front(&mut self, cx: &mut Context<'_>) -> Poll<Option<&mut Bytes>> {
        let Some(&(release, _)) = self.queue.front() else {
            self.wake_waiters(cx);
            return Poll::Ready(None);
        };

        if Instant::now() < release {
            let timer = self.timer.get_or_insert_with(|| Box::pin(sleep_until(release)));
            if timer.deadline() != release {
                timer.as_mut().reset(release);
            }

            if timer.as_mut().poll(cx).is_pending() {
                if !self.waiters.iter().any(|w| w.will_wake(cx.waker())) {
                    self.waiters.push(cx.waker().clone());
                }
                return Poll::Pending;
            }
        }

        self.wake_waiters(cx);
        Poll::Ready(self.queue.front_mut().map(|(_, data)| data))
    }

    /// Hands the due data to whichever task polls next, including tasks other than the current.
    fn wake_waiters(&mut self, cx: &Context<'_>) {
        for waker in self.waiters.drain(..) {
            if !waker.will_wake(cx.waker()) {
                waker.wake();
            }
        }
    }

    /// Marks `n` bytes at the front as delivered.
    fn consume(&mut self, n: usize) {
        if let Some((_, data)) = self.queue.front_mut() {
            data.advance(n);
            self.queued -= n;
            if data.is_empty() {
                self.queue.pop_front();
            }
        }
    }
}

/// An IO object whose traffic is shaped.
///
/// Uplink is what is read from the client, downlink is what is written to it. In each direction,
/// every unit of data reserves the link (bandwidth), is released one-way delay after its
/// transmission completes, and may be dropped as a whole (loss). Loss applies to each write
/// (downlink) or each read of the underlying IO (uplink), not to network packets: a dropped
/// unit is gone from the byte stream, which a real network would have retransmitted.
///
/// Queued downlink data goes out while the writer polls `poll_write`, `poll_flush` or
/// `poll_shutdown`. A reader and a writer on separate tasks are both woken when a lane's release
/// timer fires.
pub struct ShapedStream<Io> {
    inner: Io,
    up: Lane,
    down: Lane,
    up_eof: bool,
    rng: StdRng,
    scratch: Box<[u8]>,
    stats: Arc<ShapedStats>,
}

impl<Io> std::fmt::Debug for ShapedStream<Io> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapedStream")
            .field("up_queued", &self.up.queued)
            .field("down_queued", &self.down.queued)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<Io> ShapedStream<Io> {
    pub(crate) fn new(inner: Io, up: Lane, down: Lane, rng: StdRng) -> Self {
        Self {
            inner,
            up,
            down,
            up_eof: false,
            rng,
            scratch: Box::default(),
            stats: Arc::default(),
        }
    }

    /// Returns the transfer statistics of this connection.
    pub fn stats(&self) -> Arc<ShapedStats> {
        Arc::clone(&self.stats)
    }

    pub fn get_ref(&self) -> &Io {
        &self.inner
    }

    pub fn into_inner(self) -> Io {
        self.inner
    }
}

impl<Io: AsyncWrite + Unpin> ShapedStream<Io> {
    /// Writes every due downlink unit to the inner IO.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let Some(data) = ready!(self.down.poll_front(cx)) else {
                return Poll::Ready(Ok(()));
            };

            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &data[..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }

            self.stats.down_bytes.fetch_add(n, Ordering::Relaxed);
            self.down.consume(n);
        }
    }
}

impl<Io: AsyncRead + AsyncWrite + Unpin> AsyncRead for ShapedStream<Io> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.up.is_passthrough() && this.up.queue.is_empty() {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            this.stats.up_bytes.fetch_add(buf.filled().len() - before, Ordering::Relaxed);
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.up.poll_front(cx) {
                Poll::Ready(Some(data)) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    this.up.consume(n);
                    this.stats.up_bytes.fetch_add(n, Ordering::Relaxed);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) if this.up_eof => return Poll::Ready(Ok(())),
                // Either nothing is queued or the front is not due yet (timer registered).
                Poll::Ready(None) | Poll::Pending => {}
            }

            if this.up_eof || this.up.queued >= MAX_QUEUED {
                return Poll::Pending;
            }

            if this.scratch.is_empty() {
                this.scratch = vec![0; MAX_SEGMENT].into_boxed_slice();
            }

            let mut read = ReadBuf::new(&mut this.scratch[..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;

            let filled = read.filled();
            if filled.is_empty() {
                this.up_eof = true;
                continue;
            }

            if this.up.is_lost(&mut this.rng) {
                this.stats.up_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let data = Bytes::copy_from_slice(filled);
            this.up.schedule(Instant::now(), data);
        }
    }
}

impl<Io: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ShapedStream<Io> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.down.is_passthrough() && this.down.queue.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
            this.stats.down_bytes.fetch_add(n, Ordering::Relaxed);
            return Poll::Ready(Ok(n));
        }

        if this.down.queued >= MAX_QUEUED {
            ready!(this.poll_drain(cx))?;
        }

        let n = buf.len().min(MAX_SEGMENT);
        if n == 0 {
            return Poll::Ready(Ok(0));
        }

        if this.down.is_lost(&mut this.rng) {
            this.stats.down_dropped.fetch_add(1, Ordering::Relaxed);
            return Poll::Ready(Ok(n));
        }

        this.down.schedule(Instant::now(), Bytes::copy_from_slice(&buf[..n]));

        // Registers the timer for the new data. The write itself has been accepted.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

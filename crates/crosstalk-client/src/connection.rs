//! A pooled connection: one transport, one reader task, many in-flight
//! calls multiplexed by id.
//!
//! Callers register a call and write its frame through the shared write
//! half; the reader task is the only reader of the transport and routes
//! each response to the matching call slot, in whatever order the server
//! produces them. The reader also drives idle eviction and the keepalive:
//! a read that times out on a healthy connection turns into a ping and a
//! retried read instead of an error.
//!
//! Close is a one-way transition. The first cause wins; every call still
//! pending when the connection closes is completed with that cause.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crosstalk_wire::{self as wire, Payload};
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::call::{Call, CallFailure, CallSender};
use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::errors::RemoteError;
use crate::pool::{ConnectionKey, Pool};

/// Fixed timeout for a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Backoff between connect attempts.
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Retry cap for connect attempts that time out. Other I/O failures use the
/// configured `max_retries` instead.
const MAX_CONNECT_TIMEOUTS: u32 = 45;

/// Why a connection closed. Cloned into every pending call at cleanup.
#[derive(Debug, Clone)]
pub(crate) enum CloseCause {
    /// The client stopped with calls still pending.
    Stopped,
    /// The peer address did not resolve.
    UnknownHost,
    /// A transport failure.
    Io(Arc<io::Error>),
}

impl CloseCause {
    fn to_failure(&self) -> CallFailure {
        match self {
            CloseCause::Stopped => CallFailure::Stopped,
            CloseCause::UnknownHost => CallFailure::UnknownHost,
            CloseCause::Io(e) => CallFailure::Io(e.clone()),
        }
    }
}

/// Lifecycle of a connection. `Closing` is entered exactly once and records
/// the first cause; later causes are dropped.
enum CloseState {
    Open,
    Closing(Option<CloseCause>),
    Closed,
}

/// Guarded by the setup lock.
struct SetupState {
    started: bool,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct Connection<C: Connector, V: Payload> {
    key: ConnectionKey,
    config: Arc<ClientConfig>,
    connector: Arc<C>,
    running: Arc<AtomicBool>,
    /// Used only to deregister ourselves while closing.
    pool: Weak<Pool<C, V>>,

    /// Fast-path mirror of `state`; set exactly once, never cleared.
    closing: AtomicBool,
    state: Mutex<CloseState>,

    /// Outstanding calls by id.
    pending: Mutex<HashMap<i32, CallSender<V>>>,

    /// Write side of the transport. Requests and pings from any task
    /// serialize through this lock.
    writer: AsyncMutex<Option<WriteHalf<C::Transport>>>,

    /// Connect and reader spawn happen under this lock, never under the
    /// pool lock.
    setup: AsyncMutex<SetupState>,

    /// Wakes the reader out of its idle wait and its frame wait.
    work: Notify,

    epoch: Instant,
    /// Milliseconds since `epoch` of the last I/O activity.
    last_activity: AtomicU64,
}

impl<C: Connector, V: Payload> Connection<C, V> {
    pub(crate) fn new(key: ConnectionKey, pool: &Arc<Pool<C, V>>) -> Arc<Self> {
        Arc::new(Self {
            key,
            config: pool.config.clone(),
            connector: pool.connector.clone(),
            running: pool.running.clone(),
            pool: Arc::downgrade(pool),
            closing: AtomicBool::new(false),
            state: Mutex::new(CloseState::Open),
            pending: Mutex::new(HashMap::new()),
            writer: AsyncMutex::new(None),
            setup: AsyncMutex::new(SetupState {
                started: false,
                reader: None,
            }),
            work: Notify::new(),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
        })
    }

    /// The peer this connection talks to.
    pub(crate) fn remote_address(&self) -> &str {
        self.key.peer()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last I/O activity.
    fn idle_age(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    /// Wake the reader so it can re-check the client and close flags.
    pub(crate) fn wake(&self) {
        self.work.notify_waiters();
    }

    /// Add a call to this connection and wake the reader.
    ///
    /// Returns `false` iff the connection is already closing; the caller
    /// must then acquire a fresh connection and try again.
    pub(crate) fn register(&self, call: &mut Call<V>) -> bool {
        if self.is_closing() {
            return false;
        }
        let mut pending = self.pending.lock();
        // Re-check under the lock: cleanup drains this map only after the
        // closing flag is set, so an insert that observes the flag unset is
        // guaranteed to be drained.
        if self.is_closing() {
            return false;
        }
        let Some(completion) = call.take_completion() else {
            return false;
        };
        pending.insert(call.id, completion);
        drop(pending);
        self.work.notify_one();
        true
    }

    /// Write the call's request frame. On I/O failure the connection is
    /// marked closed with the failure as cause; the call itself is then
    /// completed by cleanup, so this never reports an error directly.
    pub(crate) async fn send(&self, call: &Call<V>) {
        if self.is_closing() {
            return;
        }
        let frame = wire::request_frame(call.id, &call.request);
        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(out) => match out.write_all(&frame).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            },
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not set up",
            )),
        };
        drop(writer);

        match result {
            Ok(()) => tracing::debug!(peer = %self.remote_address(), id = call.id, "sent call"),
            Err(e) => {
                tracing::debug!(peer = %self.remote_address(), id = call.id, error = %e, "send failed");
                self.mark_closed(Some(CloseCause::Io(Arc::new(e))));
            }
        }
    }

    /// Connect, write the header, and start the reader. Idempotent; must be
    /// called outside the pool lock since it can block for many seconds.
    ///
    /// Failures do not surface here. They mark the connection closed, and
    /// cleanup completes every registered call with the cause.
    pub(crate) async fn setup_io(self: Arc<Self>) {
        let mut setup = self.setup.lock().await;
        if setup.started || self.is_closing() {
            return;
        }
        if !self.is_running() {
            drop(setup);
            self.mark_stopped();
            self.close().await;
            return;
        }

        tracing::debug!(peer = %self.remote_address(), "connecting");
        let stream = match self.connect_with_retry().await {
            Ok(stream) => stream,
            Err(cause) => {
                drop(setup);
                self.mark_closed(Some(cause));
                self.close().await;
                return;
            }
        };

        let (read_half, mut write_half) = tokio::io::split(stream);

        let header = wire::connection_header(self.key.identity().map(|h| h.as_ref()));
        let written = match write_half.write_all(&header).await {
            Ok(()) => write_half.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            drop(setup);
            self.mark_closed(Some(CloseCause::Io(Arc::new(e))));
            self.close().await;
            return;
        }

        *self.writer.lock().await = Some(write_half);
        self.touch();

        let conn = Arc::clone(&self);
        setup.reader = Some(tokio::spawn(conn.run_reader(read_half)));
        setup.started = true;
    }

    /// The connect loop. Timeouts and other I/O failures are counted
    /// separately; whichever cap is hit first, the last observed failure is
    /// the result.
    async fn connect_with_retry(&self) -> Result<C::Transport, CloseCause> {
        let addr = match tokio::net::lookup_host(self.key.peer()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return Err(CloseCause::UnknownHost),
            },
            Err(e) => {
                tracing::debug!(peer = %self.remote_address(), error = %e, "address lookup failed");
                return Err(CloseCause::UnknownHost);
            }
        };

        let mut timeout_failures = 0u32;
        let mut io_failures = 0u32;
        loop {
            if self.is_closing() || !self.is_running() {
                return Err(CloseCause::Stopped);
            }

            match timeout(CONNECT_TIMEOUT, self.connector.connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    if io_failures >= self.config.max_retries {
                        return Err(CloseCause::Io(Arc::new(e)));
                    }
                    io_failures += 1;
                    tracing::info!(
                        peer = %self.remote_address(),
                        error = %e,
                        tried = io_failures,
                        "retrying connect"
                    );
                }
                Err(_) => {
                    if timeout_failures >= MAX_CONNECT_TIMEOUTS {
                        return Err(CloseCause::Io(Arc::new(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect to {} timed out", self.remote_address()),
                        ))));
                    }
                    timeout_failures += 1;
                    tracing::info!(
                        peer = %self.remote_address(),
                        tried = timeout_failures,
                        "connect timed out, retrying"
                    );
                }
            }

            // The backoff runs under the setup lock, so a second caller
            // cannot start a competing connect for the same connection.
            tokio::time::sleep(CONNECT_BACKOFF).await;
        }
    }

    async fn run_reader(self: Arc<Self>, read_half: ReadHalf<C::Transport>) {
        tracing::debug!(peer = %self.remote_address(), "reader started");
        let mut reader = BufReader::new(read_half);
        while self.wait_for_work().await {
            self.receive_response(&mut reader).await;
        }
        self.close().await;
        tracing::debug!(peer = %self.remote_address(), "reader stopped");
    }

    /// Wait until there is a response to read, or until this connection is
    /// done. Returns `true` if it is time to read.
    async fn wait_for_work(&self) -> bool {
        if self.pending.lock().is_empty() && !self.is_closing() && self.is_running() {
            if let Some(remaining) = self.config.max_idle_time.checked_sub(self.idle_age()) {
                let _ = timeout(remaining, self.work.notified()).await;
            }
        }

        if !self.pending.lock().is_empty() && !self.is_closing() && self.is_running() {
            true
        } else if self.is_closing() {
            false
        } else if self.pending.lock().is_empty() {
            // Idle for the whole eviction window, or stopped with nothing
            // in flight.
            tracing::debug!(peer = %self.remote_address(), "evicting idle connection");
            self.mark_closed(None);
            false
        } else {
            // The client stopped with calls still pending.
            self.mark_closed(Some(CloseCause::Stopped));
            false
        }
    }

    async fn receive_response(&self, reader: &mut BufReader<ReadHalf<C::Transport>>) {
        if self.is_closing() {
            return;
        }
        self.touch();

        if let Err(e) = self.read_one_response(reader).await {
            if !self.is_running() {
                self.mark_closed(Some(CloseCause::Stopped));
            } else {
                tracing::debug!(peer = %self.remote_address(), error = %e, "read failed");
                self.mark_closed(Some(CloseCause::Io(Arc::new(e))));
            }
        }
    }

    async fn read_one_response(
        &self,
        reader: &mut BufReader<ReadHalf<C::Transport>>,
    ) -> io::Result<()> {
        self.await_frame(reader).await?;

        // Bytes are flowing now; individual reads still get the socket
        // timeout, but a timeout mid-frame is fatal rather than pingable.
        let mut src = TimedReader::new(reader, self.config.ping_interval);
        let head = wire::read_response_head(&mut src).await?;
        tracing::debug!(peer = %self.remote_address(), id = head.call_id, "got response");

        if head.is_error {
            let class = wire::read_string(&mut src).await?;
            let message = wire::read_string(&mut src).await?;
            let slot = self.take_slot(head.call_id)?;
            let _ = slot.send(Err(CallFailure::Remote(RemoteError { class, message })));
        } else {
            let value = V::read(&mut src).await?;
            let slot = self.take_slot(head.call_id)?;
            let _ = slot.send(Ok(value));
        }
        Ok(())
    }

    /// Remove the slot for a response. A response id with no registered call
    /// means this reader and the server disagree about the stream state, so
    /// it closes the connection.
    fn take_slot(&self, call_id: i32) -> io::Result<CallSender<V>> {
        self.pending.lock().remove(&call_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response for unknown call id {call_id}"),
            )
        })
    }

    /// Block until the next response frame begins.
    ///
    /// A read timeout on a connection that is neither closing nor stopped
    /// becomes a ping and a retried wait, so an idle but healthy connection
    /// pings the server once per interval with no extra timer.
    async fn await_frame(&self, reader: &mut BufReader<ReadHalf<C::Transport>>) -> io::Result<()> {
        loop {
            tokio::select! {
                res = timeout(self.config.ping_interval, reader.fill_buf()) => match res {
                    Ok(Ok(buf)) if buf.is_empty() => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        ));
                    }
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(e)) => return Err(e),
                    Err(_elapsed) => {
                        if self.is_closing() || !self.is_running() {
                            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                        }
                        self.send_ping().await?;
                    }
                },
                _ = self.work.notified() => {
                    if self.is_closing() || !self.is_running() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read interrupted by shutdown",
                        ));
                    }
                    // A call registered while we were already reading.
                }
            }
        }
    }

    /// Write the ping sentinel if the connection has actually been quiet for
    /// a full interval. Back-to-back timeouts from multiple wrapped reads
    /// coalesce into one ping.
    async fn send_ping(&self) -> io::Result<()> {
        if self.idle_age() < self.config.ping_interval {
            return Ok(());
        }
        self.touch();
        let mut writer = self.writer.lock().await;
        if let Some(out) = writer.as_mut() {
            out.write_i32(wire::PING_CALL_ID).await?;
            out.flush().await?;
            tracing::debug!(peer = %self.remote_address(), "ping");
        }
        Ok(())
    }

    /// Transition to closing. Only the first call records a cause; every
    /// later call is a no-op. Wakes the reader and anyone else parked on
    /// this connection.
    pub(crate) fn mark_closed(&self, cause: Option<CloseCause>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, CloseState::Open) {
                return;
            }
            self.closing.store(true, Ordering::SeqCst);
            *state = CloseState::Closing(cause);
        }
        self.work.notify_waiters();
    }

    fn mark_stopped(&self) {
        let cause = if self.pending.lock().is_empty() {
            None
        } else {
            Some(CloseCause::Stopped)
        };
        self.mark_closed(cause);
    }

    /// Release everything: leave the pool, shut the transport down, and
    /// complete every pending call with the close cause. Requires
    /// `mark_closed` to have run; a second invocation logs and returns.
    pub(crate) async fn close(&self) {
        let cause = {
            let mut state = self.state.lock();
            match &*state {
                CloseState::Open => {
                    tracing::error!(
                        peer = %self.remote_address(),
                        "close called on a connection that is not closing"
                    );
                    return;
                }
                CloseState::Closed => {
                    tracing::debug!(peer = %self.remote_address(), "connection already closed");
                    return;
                }
                CloseState::Closing(cause) => {
                    let cause = cause.clone();
                    *state = CloseState::Closed;
                    cause
                }
            }
        };

        // Leave the pool first so a new connection can take this key. Skip
        // it if a replacement already did.
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_if_same(&self.key, self);
        }

        // Output side first; the input side goes down when the reader drops
        // its half.
        if let Some(mut out) = self.writer.lock().await.take() {
            let _ = out.shutdown().await;
        }

        let drained: Vec<(i32, CallSender<V>)> = self.pending.lock().drain().collect();
        let cause = match cause {
            Some(cause) => {
                tracing::debug!(
                    peer = %self.remote_address(),
                    cause = ?cause,
                    "closing connection"
                );
                Some(cause)
            }
            None if !drained.is_empty() => {
                tracing::warn!(
                    peer = %self.remote_address(),
                    "connection closed for no cause with calls still pending"
                );
                Some(CloseCause::Io(Arc::new(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "unexpected closed connection",
                ))))
            }
            None => None,
        };
        if let Some(cause) = cause {
            for (_, slot) in drained {
                let _ = slot.send(Err(cause.to_failure()));
            }
        }
        tracing::debug!(peer = %self.remote_address(), "connection closed");
    }

    /// Stop-path teardown: join the reader if one was started, otherwise
    /// close directly.
    pub(crate) async fn shutdown(&self) {
        let handle = { self.setup.lock().await.reader.take() };
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => {
                self.mark_stopped();
                self.close().await;
            }
        }
    }
}

/// An `AsyncRead` adapter that fails a read attempt which makes no progress
/// within the limit, like a socket read timeout.
struct TimedReader<'a, R> {
    inner: &'a mut R,
    limit: Duration,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<'a, R: AsyncRead + Unpin> TimedReader<'a, R> {
    fn new(inner: &'a mut R, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            deadline: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TimedReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut *this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                let limit = this.limit;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out mid-frame",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

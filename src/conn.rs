//! Persistent connection with its HTTP request/response state machine.
//!
//! A [`Connection`] owns one non-blocking TCP socket and drives one request
//! at a time through connect → send → receive. Every terminal path goes
//! through [`finish`](Connection::finish): it cancels the deadline, commits
//! the post-finish state, and invokes the request's callbacks exactly once.
//! A connection that ends up `Closed` stays in the pool; the next assignment
//! opens a fresh socket.

use bytes::BytesMut;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{Origin, RequestHandle};
use crate::codec::{encode_request, HttpResponse, ResponseDecoder};
use crate::event_loop::{LoopCtx, SourceToken};
use crate::outcome::Outcome;
use crate::timer::TimerToken;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Socket open and quiet; ready for the next request.
    Idle,
    /// Non-blocking connect in progress.
    Connecting,
    /// Writing the serialized request.
    Sending,
    /// Waiting for the response head.
    ReceivingHeaders,
    /// Reading the response body.
    ReceivingBody,
    /// No usable socket; the next assignment reconnects.
    Closed,
}

/// One slot of the connection pool.
pub(crate) struct Connection {
    index: usize,
    origin: Arc<Origin>,
    state: State,
    socket: Option<TcpStream>,
    source: Option<SourceToken>,
    handle: Option<RequestHandle>,
    deadline: Option<TimerToken>,
    out: BytesMut,
    out_pos: usize,
    decoder: Option<ResponseDecoder>,
    debug: Arc<AtomicBool>,
}

impl Connection {
    pub(crate) fn new(index: usize, origin: Arc<Origin>, debug: Arc<AtomicBool>) -> Self {
        Self {
            index,
            origin,
            state: State::Closed,
            socket: None,
            source: None,
            handle: None,
            deadline: None,
            out: BytesMut::new(),
            out_pos: 0,
            decoder: None,
            debug,
        }
    }

    /// True when no request is in flight; `Idle` and `Closed` connections
    /// are both assignable.
    pub(crate) fn is_available(&self) -> bool {
        self.handle.is_none()
    }

    fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Takes ownership of a request and starts driving it.
    ///
    /// The deadline timer is armed here, when the request leaves the queue.
    /// Immediate failures (resolution, socket setup) finish inline.
    pub(crate) fn assign(&mut self, ctx: &mut LoopCtx<'_>, handle: RequestHandle) {
        debug_assert!(self.handle.is_none(), "connection already has a request");

        self.out = encode_request(&handle.request, self.origin.authority());
        self.out_pos = 0;
        self.decoder = Some(ResponseDecoder::new(handle.request.method));
        let timeout_ms = handle.request.timeout_ms;
        self.handle = Some(handle);

        if timeout_ms > 0 {
            let after = Duration::from_millis(timeout_ms.unsigned_abs());
            self.deadline = Some(ctx.arm_timer(after, self.index as u64));
        }

        if self.socket.is_some() && self.state == State::Idle {
            if self.debug_enabled() {
                tracing::debug!(conn = self.index, "reusing idle connection");
            }
            self.state = State::Sending;
            self.drive_send(ctx);
        } else {
            self.begin_connect(ctx);
        }
    }

    /// Readiness event for this connection's socket.
    pub(crate) fn handle_io(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        readable: bool,
        writable: bool,
    ) {
        match self.state {
            State::Connecting if writable => self.finish_connect(ctx),
            State::Sending if writable => self.drive_send(ctx),
            State::ReceivingHeaders | State::ReceivingBody if readable => self.drive_recv(ctx),
            State::Idle if readable => self.idle_readable(ctx),
            _ => {}
        }
    }

    /// Deadline expiry: the request is over, the socket is discarded so a
    /// late server response cannot be misdelivered.
    pub(crate) fn handle_timeout(&mut self, ctx: &mut LoopCtx<'_>) {
        if self.handle.is_none() {
            return;
        }
        if self.debug_enabled() {
            tracing::debug!(conn = self.index, state = ?self.state, "request deadline expired");
        }
        self.finish(ctx, Outcome::Timeout, 0, None);
    }

    /// Tears down the socket and timer without touching any in-flight
    /// request. Used when the dispatcher shuts down.
    pub(crate) fn close(&mut self, ctx: &mut LoopCtx<'_>) {
        if let Some(token) = self.deadline.take() {
            ctx.cancel_timer(token);
        }
        self.drop_socket(ctx);
        self.state = State::Closed;
    }

    fn begin_connect(&mut self, ctx: &mut LoopCtx<'_>) {
        self.drop_socket(ctx);

        let Some(addr) = resolve(&self.origin) else {
            self.finish(ctx, Outcome::HostNotFound, 0, None);
            return;
        };

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
        {
            Ok(socket) => socket,
            Err(_) => {
                self.finish(ctx, Outcome::CouldNotConnect, 0, None);
                return;
            }
        };

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {
                let stream: TcpStream = socket.into();
                match ctx.register(&stream, self.index as u64, false, false) {
                    Ok(token) => {
                        self.socket = Some(stream);
                        self.source = Some(token);
                        self.state = State::Sending;
                        self.drive_send(ctx);
                    }
                    Err(_) => self.finish(ctx, Outcome::CouldNotConnect, 0, None),
                }
            }
            Err(err) if connect_in_progress(&err) => {
                let stream: TcpStream = socket.into();
                match ctx.register(&stream, self.index as u64, false, true) {
                    Ok(token) => {
                        self.socket = Some(stream);
                        self.source = Some(token);
                        self.state = State::Connecting;
                        if self.debug_enabled() {
                            tracing::debug!(conn = self.index, %addr, "connect in progress");
                        }
                    }
                    Err(_) => self.finish(ctx, Outcome::CouldNotConnect, 0, None),
                }
            }
            Err(_) => self.finish(ctx, Outcome::CouldNotConnect, 0, None),
        }
    }

    /// Writable after a pending connect: resolve whether it succeeded.
    fn finish_connect(&mut self, ctx: &mut LoopCtx<'_>) {
        let status = {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            match socket.take_error() {
                Ok(Some(_)) | Err(_) => ConnectStatus::Failed,
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => ConnectStatus::Connected,
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                        ConnectStatus::Pending
                    }
                    Err(_) => ConnectStatus::Failed,
                },
            }
        };

        match status {
            ConnectStatus::Connected => {
                if self.debug_enabled() {
                    tracing::debug!(conn = self.index, "connection established");
                }
                self.state = State::Sending;
                self.drive_send(ctx);
            }
            ConnectStatus::Pending => {
                self.rearm(ctx, false, true);
            }
            ConnectStatus::Failed => self.finish(ctx, Outcome::CouldNotConnect, 0, None),
        }
    }

    /// Writes request bytes until done or the socket would block.
    fn drive_send(&mut self, ctx: &mut LoopCtx<'_>) {
        loop {
            let result = {
                let Some(socket) = self.socket.as_ref() else {
                    self.finish(ctx, Outcome::SendError, 0, None);
                    return;
                };
                let mut writer: &TcpStream = socket;
                writer.write(&self.out[self.out_pos..])
            };
            match result {
                Ok(0) => {
                    self.finish(ctx, Outcome::SendError, 0, None);
                    return;
                }
                Ok(n) => {
                    self.out_pos += n;
                    if self.out_pos == self.out.len() {
                        self.state = State::ReceivingHeaders;
                        self.rearm(ctx, true, false);
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.rearm(ctx, false, true);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.finish(ctx, Outcome::SendError, 0, None);
                    return;
                }
            }
        }
    }

    /// Reads response bytes until a full response, EOF, or would-block.
    fn drive_recv(&mut self, ctx: &mut LoopCtx<'_>) {
        let mut scratch = [0u8; 8192];
        loop {
            let result = {
                let Some(socket) = self.socket.as_ref() else {
                    self.finish(ctx, Outcome::RecvError, 0, None);
                    return;
                };
                let mut reader: &TcpStream = socket;
                reader.read(&mut scratch)
            };
            match result {
                Ok(0) => {
                    let eof = self.decoder.as_mut().map(ResponseDecoder::finish_eof);
                    match eof {
                        Some(Ok(Some(response))) => self.complete(ctx, response),
                        _ => self.finish(ctx, Outcome::RecvError, 0, None),
                    }
                    return;
                }
                Ok(n) => {
                    let step = self
                        .decoder
                        .as_mut()
                        .map(|decoder| decoder.push(&scratch[..n]));
                    match step {
                        Some(Ok(Some(response))) => {
                            self.complete(ctx, response);
                            return;
                        }
                        Some(Ok(None)) => {
                            if self.state == State::ReceivingHeaders
                                && self.decoder.as_ref().is_some_and(ResponseDecoder::has_head)
                            {
                                self.state = State::ReceivingBody;
                            }
                        }
                        _ => {
                            self.finish(ctx, Outcome::RecvError, 0, None);
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.rearm(ctx, true, false);
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.finish(ctx, Outcome::RecvError, 0, None);
                    return;
                }
            }
        }
    }

    /// A full response arrived: commit the post-finish state, then deliver.
    fn complete(&mut self, ctx: &mut LoopCtx<'_>, response: HttpResponse) {
        if response.keep_alive {
            self.state = State::Idle;
            // Keep watching so a peer close while idle retires the socket
            // before the next assignment tries to reuse it.
            self.rearm(ctx, true, false);
        } else {
            self.drop_socket(ctx);
            self.state = State::Closed;
        }
        let status = response.status;
        self.finish(ctx, Outcome::None, status, Some(response));
    }

    /// Peer activity on an idle connection means it is no longer reusable.
    fn idle_readable(&mut self, ctx: &mut LoopCtx<'_>) {
        let mut scratch = [0u8; 512];
        let result = {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            let mut reader: &TcpStream = socket;
            reader.read(&mut scratch)
        };
        match result {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.rearm(ctx, true, false);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                self.rearm(ctx, true, false);
            }
            _ => {
                if self.debug_enabled() {
                    tracing::debug!(conn = self.index, "idle connection closed by peer");
                }
                self.drop_socket(ctx);
                self.state = State::Closed;
            }
        }
    }

    /// Terminal path for every request: cancels the deadline, commits the
    /// connection state, releases the handle, and invokes the callbacks.
    fn finish(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        outcome: Outcome,
        status: u16,
        response: Option<HttpResponse>,
    ) {
        if let Some(token) = self.deadline.take() {
            ctx.cancel_timer(token);
        }
        if outcome.is_error() {
            self.drop_socket(ctx);
            self.state = State::Closed;
        }
        self.decoder = None;
        self.out.clear();
        self.out_pos = 0;

        let Some(handle) = self.handle.take() else {
            return;
        };
        let (headers, body) = match response {
            Some(response) => (response.head_text, response.body),
            None => (String::new(), Vec::new()),
        };
        if self.debug_enabled() {
            tracing::debug!(
                conn = self.index,
                %outcome,
                status,
                elapsed_ms = handle.submitted_at.elapsed().as_millis() as u64,
                "request finished"
            );
        }
        handle
            .callbacks
            .on_response(&handle.request, outcome, status, headers, body);
    }

    fn rearm(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, writable: bool) {
        let (Some(socket), Some(token)) = (self.socket.as_ref(), self.source) else {
            return;
        };
        if ctx.set_interest(socket, token, readable, writable).is_err() {
            // The poller rejected the socket; it is no longer usable.
            self.drop_socket(ctx);
            self.state = State::Closed;
            if self.handle.is_some() {
                self.finish(ctx, Outcome::Unknown, 0, None);
            }
        }
    }

    fn drop_socket(&mut self, ctx: &mut LoopCtx<'_>) {
        if let (Some(socket), Some(token)) = (self.socket.take(), self.source.take()) {
            let _ = ctx.deregister(&socket, token);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ConnectStatus {
    Connected,
    Pending,
    Failed,
}

/// Resolves the origin to a socket address, preferring the first result.
/// Resolution failure and an empty result both mean the host was not found.
fn resolve(origin: &Origin) -> Option<SocketAddr> {
    (origin.host.as_str(), origin.port)
        .to_socket_addrs()
        .ok()?
        .next()
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

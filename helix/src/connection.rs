//! Per-connection adapter between socket readiness and the HTTP/2 engine.
//!
//! Reads are fed to the engine chunk by chunk as they arrive. Engine output
//! is queued in emission order and written as far as the transport allows;
//! a partial write only advances the front buffer, so bytes are never lost
//! or repeated across readiness cycles. The adapter never blocks: each entry
//! point runs until the transport would block and reports what to wait for.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use helix_h2::{ErrorCode, H2Connection, H2Error, H2Event, Settings};
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::metrics;
use crate::request::{Handler, Headers, Request};
use crate::stream::Transport;

/// Readiness the connection needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

#[derive(Default)]
struct RequestContext {
    headers: Headers,
    body: BytesMut,
}

pub struct Connection<T: Transport> {
    transport: T,
    h2: H2Connection,
    outbound: VecDeque<Bytes>,
    streams: HashMap<u32, RequestContext>,
    handler: Arc<dyn Handler>,
    read_buf: Vec<u8>,
    max_request_body: usize,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl<T: Transport> Connection<T> {
    /// Wrap an established transport. The server SETTINGS preface is
    /// queued immediately.
    pub fn new(
        transport: T,
        settings: Settings,
        handler: Arc<dyn Handler>,
        read_buffer_size: usize,
    ) -> Self {
        let peer = transport.peer_addr().ok();
        let mut conn = Connection {
            transport,
            h2: H2Connection::server(settings),
            outbound: VecDeque::new(),
            streams: HashMap::new(),
            handler,
            read_buf: vec![0; read_buffer_size],
            max_request_body: usize::MAX,
            peer,
            closed: false,
        };
        conn.queue_engine_output();
        conn
    }

    /// Reset streams whose request body grows past `limit` bytes.
    pub fn with_max_request_body(mut self, limit: usize) -> Self {
        self.max_request_body = limit;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queued output not yet accepted by the socket.
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty() || self.transport.wants_write()
    }

    /// Read path: drain the transport, feeding each chunk to the engine and
    /// answering completed requests.
    pub fn on_readable(&mut self) -> Next {
        if self.closed {
            return Next::Close;
        }
        loop {
            match self.transport.read(&mut self.read_buf) {
                Ok(0) => {
                    info!(peer = ?self.peer, "peer closed connection");
                    return Next::Close;
                }
                Ok(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    if let Err(err) = self.feed(n) {
                        self.log_failure(&err);
                        // Let a queued GOAWAY out if the socket takes it.
                        let _ = self.flush();
                        return Next::Close;
                    }
                    match self.flush() {
                        Ok(true) => {}
                        // Stop reading until the peer drains our output.
                        Ok(false) => return Next::Write,
                        Err(err) => return self.io_failure(err),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.io_failure(e),
            }
        }

        // Output queued by the preface or a previous cycle.
        match self.flush() {
            Ok(true) if self.h2.is_closed() => Next::Close,
            Ok(true) => Next::Read,
            Ok(false) => Next::Write,
            Err(err) => self.io_failure(err),
        }
    }

    /// Write path: flush queued output. Once everything is out, reading
    /// resumes inline since plaintext may already be buffered.
    pub fn on_writable(&mut self) -> Next {
        if self.closed {
            return Next::Close;
        }
        match self.flush() {
            Ok(true) if self.h2.is_closed() => Next::Close,
            Ok(true) => self.on_readable(),
            Ok(false) => Next::Write,
            Err(err) => self.io_failure(err),
        }
    }

    /// Close the transport. Returns `false` if already torn down.
    pub fn teardown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Err(err) = self.transport.close() {
            trace!(?err, "transport close");
        }
        match self.disconnected_peer() {
            Some(peer) => info!(%peer, "disconnected"),
            None => info!("disconnected"),
        }
        self.outbound.clear();
        self.streams.clear();
        true
    }

    /// A reset socket may no longer report its peer; fall back to the
    /// address seen at construction.
    fn disconnected_peer(&self) -> Option<SocketAddr> {
        self.transport.peer_addr().ok().or(self.peer)
    }

    fn feed(&mut self, n: usize) -> Result<(), Error> {
        let result = self.h2.recv(&self.read_buf[..n]);
        // A connection error still queues a GOAWAY.
        self.queue_engine_output();
        result?;
        self.dispatch()
    }

    fn dispatch(&mut self) -> Result<(), Error> {
        while let Some(event) = self.h2.poll_event() {
            match event {
                H2Event::StreamOpened { stream_id } => {
                    self.streams.insert(stream_id, RequestContext::default());
                }
                H2Event::Headers {
                    stream_id, headers, ..
                } => {
                    if let Some(ctx) = self.streams.get_mut(&stream_id) {
                        ctx.headers.extend_fields(headers);
                    }
                }
                H2Event::Data {
                    stream_id, data, ..
                } => {
                    let Some(ctx) = self.streams.get_mut(&stream_id) else {
                        continue;
                    };
                    if ctx.body.len() + data.len() > self.max_request_body {
                        metrics::STREAMS_BODY_LIMIT.increment();
                        debug!(
                            peer = ?self.peer,
                            stream_id,
                            limit = self.max_request_body,
                            "request body too large, resetting stream"
                        );
                        self.streams.remove(&stream_id);
                        self.h2.reset_stream(stream_id, ErrorCode::Cancel);
                        continue;
                    }
                    ctx.body.extend_from_slice(&data);
                }
                H2Event::HalfClosed { stream_id } => {
                    if let Some(ctx) = self.streams.remove(&stream_id) {
                        self.respond(stream_id, ctx)?;
                    }
                }
                H2Event::StreamReset {
                    stream_id,
                    error_code,
                } => {
                    debug!(peer = ?self.peer, stream_id, ?error_code, "stream reset");
                    self.streams.remove(&stream_id);
                }
                H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    ..
                } => {
                    debug!(peer = ?self.peer, last_stream_id, ?error_code, "peer sent GOAWAY");
                }
                H2Event::SettingsAcknowledged => {
                    trace!(peer = ?self.peer, "settings acknowledged");
                }
            }
        }
        self.queue_engine_output();
        Ok(())
    }

    fn respond(&mut self, stream_id: u32, ctx: RequestContext) -> Result<(), Error> {
        let request = Request {
            stream_id,
            headers: ctx.headers,
            body: ctx.body.freeze(),
        };
        let handler = &self.handler;
        let response = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(Error::Handler(err)),
            Err(payload) => return Err(Error::Handler(panic_message(payload).into())),
        };
        let fields = response.header_fields().map_err(Error::Handler)?;

        let sent = match response.payload() {
            Some(body) => self
                .h2
                .send_headers(stream_id, &fields, false)
                .and_then(|()| self.h2.send_data(stream_id, body, true)),
            None => self.h2.send_headers(stream_id, &fields, true),
        };
        match sent {
            Ok(()) => {
                metrics::STREAMS_COMPLETED.increment();
                Ok(())
            }
            // The stream went away; the connection is still good.
            Err(H2Error::StreamError(id, code)) => {
                debug!(peer = ?self.peer, stream_id = id, ?code, "response dropped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn queue_engine_output(&mut self) {
        if self.h2.has_pending_send() {
            self.outbound.push_back(Bytes::from(self.h2.take_pending_send()));
        }
    }

    /// Write queued output. `Ok(true)` when the queue and the transport's
    /// own buffer are both empty.
    fn flush(&mut self) -> io::Result<bool> {
        while let Some(front) = self.outbound.front_mut() {
            match self.transport.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    metrics::BYTES_SENT.add(n as u64);
                    front.advance(n);
                    if front.is_empty() {
                        self.outbound.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(!self.transport.wants_write()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn io_failure(&self, err: io::Error) -> Next {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                info!(peer = ?self.peer, %err, "peer went away");
            }
            _ => warn!(peer = ?self.peer, %err, "connection I/O error"),
        }
        Next::Close
    }

    fn log_failure(&self, err: &Error) {
        match err {
            Error::Handler(_) => {
                metrics::HANDLER_ERRORS.increment();
                error!(peer = ?self.peer, %err, "handler failed");
            }
            _ => warn!(peer = ?self.peer, %err, "protocol error"),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

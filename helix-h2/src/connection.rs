//! HTTP/2 server connection state machine.
//!
//! `H2Connection` is a sans-IO HTTP/2 server. Feed bytes in via `recv()`,
//! pull bytes out via `take_pending_send()`, and drain events with `poll_event()`.

use std::collections::{HashMap, VecDeque};

use crate::error::{ErrorCode, H2Error};
use crate::flowcontrol::{self, Window};
use crate::frame::{self, FRAME_HEADER_LEN, Frame};
use crate::hpack::{Decoder, Encoder, HeaderField};
use crate::settings::Settings;
use crate::stream::{H2Stream, PendingData};

/// HTTP/2 connection preface (RFC 7540 Section 3.5).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Locally reset stream ids remembered so late frames on them are ignored.
const RESET_HISTORY: usize = 32;

/// Events produced by the HTTP/2 connection for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Event {
    /// The peer opened a new request stream.
    StreamOpened { stream_id: u32 },
    /// A complete header block arrived: the request headers, or trailers
    /// when the stream already delivered its headers.
    Headers {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Request body bytes.
    Data {
        stream_id: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// The peer finished sending; the request is complete.
    HalfClosed { stream_id: u32 },
    /// The stream was reset, either by the peer or because it violated the
    /// protocol. Nothing more may be sent on it.
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// Peer sent GOAWAY.
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    /// Peer acknowledged our SETTINGS.
    SettingsAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Matching the 24-byte client magic.
    AwaitingPreface,
    /// Magic seen; the next frame must be the client's SETTINGS.
    AwaitingSettings,
    Open,
    /// GOAWAY sent or received; in-flight streams may finish.
    Closing,
    /// A connection error was raised. Nothing but the queued GOAWAY remains.
    Closed,
}

/// A header block spread over HEADERS + CONTINUATION frames.
struct PartialBlock {
    stream_id: u32,
    fragments: Vec<u8>,
    end_stream: bool,
}

/// Server-side HTTP/2 connection.
pub struct H2Connection {
    state: ConnState,
    local_settings: Settings,
    remote_settings: Settings,

    streams: HashMap<u32, H2Stream>,
    /// Highest client stream id seen so far. Ids at or below it that are not
    /// in `streams` are closed; ids above it are idle.
    last_stream_id: u32,
    /// Most recent streams reset by this side, oldest first.
    recently_reset: VecDeque<u32>,
    goaway_sent: bool,

    conn_recv_window: Window,
    conn_send_window: Window,
    /// Bytes of DATA received since the last connection WINDOW_UPDATE.
    conn_unacked_recv: u32,
    conn_recv_initial: i64,

    encoder: Encoder,
    decoder: Decoder,

    /// No other frames may interleave until END_HEADERS.
    partial_block: Option<PartialBlock>,

    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    events: VecDeque<H2Event>,
}

impl H2Connection {
    /// Create a server-side connection. The server preface (SETTINGS) is
    /// queued into the send buffer immediately.
    pub fn server(settings: Settings) -> Self {
        let mut send_buf = Vec::new();
        Frame::Settings {
            ack: false,
            params: settings.to_params(),
        }
        .encode(&mut send_buf);

        // The connection window is not covered by INITIAL_WINDOW_SIZE and starts
        // at the protocol default; widen it explicitly.
        let initial_recv = i64::from(settings.initial_window_size);
        let conn_recv_initial = initial_recv.max(flowcontrol::DEFAULT_WINDOW_SIZE);
        if conn_recv_initial > flowcontrol::DEFAULT_WINDOW_SIZE {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (conn_recv_initial - flowcontrol::DEFAULT_WINDOW_SIZE) as u32,
            }
            .encode(&mut send_buf);
        }

        Self {
            state: ConnState::AwaitingPreface,
            local_settings: settings,
            remote_settings: Settings::default(),
            streams: HashMap::new(),
            last_stream_id: 0,
            recently_reset: VecDeque::new(),
            goaway_sent: false,
            conn_recv_window: Window::new(conn_recv_initial),
            conn_send_window: Window::default(),
            conn_unacked_recv: 0,
            conn_recv_initial,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            partial_block: None,
            recv_buf: Vec::new(),
            send_buf,
            events: VecDeque::new(),
        }
    }

    /// Feed received bytes from the transport.
    ///
    /// On a connection error a GOAWAY carrying the error code is queued and
    /// the error is returned; the caller should flush `take_pending_send()`
    /// and close the transport.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        self.recv_buf.extend_from_slice(data);
        self.process_recv_buf().inspect_err(|err| self.fail(err))
    }

    /// Poll the next event, if any.
    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    /// Take all pending bytes to send to the transport.
    pub fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buf)
    }

    /// Whether there are bytes pending to send.
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Streams that are open or waiting for their response to finish.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether response data on `stream_id` is parked waiting for window.
    pub fn is_blocked(&self, stream_id: u32) -> bool {
        self.streams
            .get(&stream_id)
            .is_some_and(|s| s.pending.is_some())
    }

    /// Send a header block on a stream. Blocks larger than the peer's
    /// MAX_FRAME_SIZE are split into HEADERS + CONTINUATION.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.can_send())
            .ok_or(H2Error::StreamError(stream_id, ErrorCode::StreamClosed))?;
        if stream.pending.is_some() {
            return Err(H2Error::ProtocolError(format!(
                "headers on stream {stream_id} while body is still queued"
            )));
        }

        let block = self.encoder.encode(headers);
        let max_frame = self.remote_settings.max_frame_size as usize;
        let mut fragments = block.chunks(max_frame).peekable();
        let first = fragments.next().unwrap_or(&[]);
        Frame::Headers {
            stream_id,
            encoded: first.to_vec(),
            end_stream,
            end_headers: fragments.peek().is_none(),
            priority: None,
        }
        .encode(&mut self.send_buf);
        while let Some(fragment) = fragments.next() {
            Frame::Continuation {
                stream_id,
                encoded: fragment.to_vec(),
                end_headers: fragments.peek().is_none(),
            }
            .encode(&mut self.send_buf);
        }

        if end_stream {
            stream.close_local();
            self.reap(stream_id);
        }
        Ok(())
    }

    /// Send body bytes on a stream.
    ///
    /// Data is framed by the peer's MAX_FRAME_SIZE and limited by the
    /// connection and stream send windows. Whatever does not fit is parked on
    /// the stream and released as WINDOW_UPDATEs arrive.
    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<(), H2Error> {
        if self.state == ConnState::Closed {
            return Err(H2Error::Closed);
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .filter(|s| s.can_send())
            .ok_or(H2Error::StreamError(stream_id, ErrorCode::StreamClosed))?;

        match stream.pending.as_mut() {
            Some(pending) if pending.end_stream => {
                return Err(H2Error::StreamError(stream_id, ErrorCode::StreamClosed));
            }
            Some(pending) => {
                pending.data.extend(data);
                pending.end_stream = end_stream;
            }
            None => {
                stream.pending = Some(PendingData {
                    data: data.iter().copied().collect(),
                    end_stream,
                });
            }
        }
        self.drain_stream(stream_id);
        Ok(())
    }

    /// Reset a stream with an error code.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        Frame::RstStream {
            stream_id,
            error_code,
        }
        .encode(&mut self.send_buf);
        if self.streams.remove(&stream_id).is_some() {
            if self.recently_reset.len() == RESET_HISTORY {
                self.recently_reset.pop_front();
            }
            self.recently_reset.push_back(stream_id);
        }
    }

    /// Send a GOAWAY frame. Streams already open may still complete; new
    /// ones are ignored.
    pub fn send_goaway(&mut self, error_code: ErrorCode) {
        if self.state == ConnState::Closed || self.goaway_sent {
            return;
        }
        Frame::GoAway {
            last_stream_id: self.last_stream_id,
            error_code,
            debug_data: Vec::new(),
        }
        .encode(&mut self.send_buf);
        self.goaway_sent = true;
        self.state = ConnState::Closing;
    }

    /// Whether the connection has no further work: a connection error was
    /// raised, or a GOAWAY was exchanged and every stream has finished.
    pub fn is_closed(&self) -> bool {
        match self.state {
            ConnState::Closed => true,
            ConnState::Closing => self.streams.is_empty(),
            _ => false,
        }
    }

    // -- Internal processing --

    fn fail(&mut self, err: &H2Error) {
        Frame::GoAway {
            last_stream_id: self.last_stream_id,
            error_code: err.code(),
            debug_data: err.to_string().into_bytes(),
        }
        .encode(&mut self.send_buf);
        self.state = ConnState::Closed;
        self.recv_buf.clear();
        self.streams.clear();
        self.partial_block = None;
    }

    fn process_recv_buf(&mut self) -> Result<(), H2Error> {
        if self.state == ConnState::AwaitingPreface {
            // Reject as soon as a byte diverges instead of waiting for all 24.
            let n = self.recv_buf.len().min(CLIENT_PREFACE.len());
            if self.recv_buf[..n] != CLIENT_PREFACE[..n] {
                return Err(H2Error::InvalidPreface);
            }
            if n < CLIENT_PREFACE.len() {
                return Ok(());
            }
            self.recv_buf.drain(..n);
            self.state = ConnState::AwaitingSettings;
        }

        let mut pos = 0;
        let result = loop {
            let max_frame = self.local_settings.max_frame_size;
            match frame::decode_frame(&self.recv_buf[pos..], max_frame) {
                Ok(Some((frame, consumed))) => {
                    pos += consumed;
                    let payload_len = (consumed - FRAME_HEADER_LEN) as u32;
                    if let Err(err) = self.handle_frame(frame, payload_len) {
                        break Err(err);
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.recv_buf.drain(..pos);
        result
    }

    fn handle_frame(&mut self, frame: Frame, payload_len: u32) -> Result<(), H2Error> {
        if self.state == ConnState::AwaitingSettings {
            if !matches!(frame, Frame::Settings { ack: false, .. }) {
                return Err(H2Error::ProtocolError(
                    "first frame after preface must be SETTINGS".into(),
                ));
            }
            self.state = ConnState::Open;
        }

        if let Some(block) = &self.partial_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == block.stream_id => {}
                _ => {
                    return Err(H2Error::ProtocolError("expected CONTINUATION frame".into()));
                }
            }
        }

        match frame {
            Frame::Settings { ack, params } => self.handle_settings(ack, &params)?,
            Frame::Headers {
                stream_id,
                encoded,
                end_stream,
                end_headers,
                ..
            } => {
                if end_headers {
                    self.handle_header_block(stream_id, &encoded, end_stream)?;
                } else {
                    self.partial_block = Some(PartialBlock {
                        stream_id,
                        fragments: encoded,
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                encoded,
                end_headers,
                ..
            } => {
                let Some(block) = self.partial_block.as_mut() else {
                    return Err(H2Error::ProtocolError("unexpected CONTINUATION frame".into()));
                };
                block.fragments.extend_from_slice(&encoded);
                if end_headers
                    && let Some(block) = self.partial_block.take()
                {
                    self.handle_header_block(block.stream_id, &block.fragments, block.end_stream)?;
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.handle_data(stream_id, payload, end_stream, payload_len)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if stream_id > self.last_stream_id {
                    return Err(H2Error::ProtocolError("RST_STREAM on idle stream".into()));
                }
                if self.streams.remove(&stream_id).is_some() {
                    self.events.push_back(H2Event::StreamReset {
                        stream_id,
                        error_code,
                    });
                }
            }
            Frame::Ping { ack, opaque_data } => {
                if !ack {
                    Frame::Ping {
                        ack: true,
                        opaque_data,
                    }
                    .encode(&mut self.send_buf);
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.state = ConnState::Closing;
                self.events.push_back(H2Event::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data,
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment)?,
            Frame::PushPromise { .. } => {
                return Err(H2Error::ProtocolError("PUSH_PROMISE sent by client".into()));
            }
            // Priority is advisory.
            Frame::Priority { .. } => {}
            // Unknown frame types MUST be ignored.
            Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn handle_settings(&mut self, ack: bool, params: &[(u16, u32)]) -> Result<(), H2Error> {
        if ack {
            self.events.push_back(H2Event::SettingsAcknowledged);
            return Ok(());
        }

        let old_initial = i64::from(self.remote_settings.initial_window_size);
        self.remote_settings.apply(params)?;
        let delta = i64::from(self.remote_settings.initial_window_size) - old_initial;

        // Section 6.9.2: the change applies to every stream send window.
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.shift(delta)?;
            }
        }

        Frame::Settings {
            ack: true,
            params: Vec::new(),
        }
        .encode(&mut self.send_buf);

        if delta > 0 {
            self.drain_all();
        }
        Ok(())
    }

    fn handle_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        // Always decode, even for streams about to be refused, so the HPACK
        // dynamic table stays in sync with the peer.
        let headers = self.decoder.decode(block)?;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.can_recv() {
                self.reset_local(stream_id, ErrorCode::StreamClosed);
                return Ok(());
            }
            // A second header block is only legal as trailers.
            if !end_stream {
                self.reset_local(stream_id, ErrorCode::ProtocolError);
                return Ok(());
            }
            stream.close_remote();
            self.events.push_back(H2Event::Headers {
                stream_id,
                headers,
                end_stream,
            });
            self.events.push_back(H2Event::HalfClosed { stream_id });
            self.reap(stream_id);
            return Ok(());
        }

        if stream_id % 2 == 0 {
            return Err(H2Error::ProtocolError(format!(
                "client opened even stream {stream_id}"
            )));
        }
        // Trailers racing our RST_STREAM.
        if self.recently_reset.contains(&stream_id) {
            return Ok(());
        }
        if stream_id <= self.last_stream_id {
            return Err(H2Error::ProtocolError(format!(
                "HEADERS on closed stream {stream_id}"
            )));
        }
        self.last_stream_id = stream_id;

        if self.goaway_sent {
            return Ok(());
        }
        if let Some(max) = self.local_settings.max_concurrent_streams
            && self.streams.len() >= max as usize
        {
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::RefusedStream,
            }
            .encode(&mut self.send_buf);
            return Ok(());
        }

        let mut stream = H2Stream::new(
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        if end_stream {
            stream.close_remote();
        }
        self.streams.insert(stream_id, stream);

        self.events.push_back(H2Event::StreamOpened { stream_id });
        self.events.push_back(H2Event::Headers {
            stream_id,
            headers,
            end_stream,
        });
        if end_stream {
            self.events.push_back(H2Event::HalfClosed { stream_id });
        }
        Ok(())
    }

    fn handle_data(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
        flow_len: u32,
    ) -> Result<(), H2Error> {
        if stream_id > self.last_stream_id {
            return Err(H2Error::ProtocolError("DATA on idle stream".into()));
        }

        // Padding counts against flow control, so use the full payload length.
        self.conn_recv_window.consume(flow_len)?;
        self.conn_unacked_recv += flow_len;
        if i64::from(self.conn_unacked_recv) >= self.conn_recv_initial / 2 {
            let increment = std::mem::take(&mut self.conn_unacked_recv);
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            }
            .encode(&mut self.send_buf);
            let _ = self.conn_recv_window.credit(increment);
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // Closed stream; the bytes only count toward the connection window.
            return Ok(());
        };
        if !stream.can_recv() {
            self.reset_local(stream_id, ErrorCode::StreamClosed);
            return Ok(());
        }
        if stream.recv_window.consume(flow_len).is_err() {
            self.reset_local(stream_id, ErrorCode::FlowControlError);
            return Ok(());
        }

        if end_stream {
            stream.close_remote();
        } else {
            stream.unacked_recv += flow_len;
            let threshold = i64::from(self.local_settings.initial_window_size) / 2;
            if i64::from(stream.unacked_recv) >= threshold {
                let increment = std::mem::take(&mut stream.unacked_recv);
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
                .encode(&mut self.send_buf);
                let _ = stream.recv_window.credit(increment);
            }
        }

        if !payload.is_empty() || end_stream {
            self.events.push_back(H2Event::Data {
                stream_id,
                data: payload,
                end_stream,
            });
        }
        if end_stream {
            self.events.push_back(H2Event::HalfClosed { stream_id });
            self.reap(stream_id);
        }
        Ok(())
    }

    fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            self.conn_send_window.credit(increment)?;
            self.drain_all();
            return Ok(());
        }
        if stream_id > self.last_stream_id {
            return Err(H2Error::ProtocolError("WINDOW_UPDATE on idle stream".into()));
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.send_window.credit(increment).is_err() {
                self.reset_local(stream_id, ErrorCode::FlowControlError);
                return Ok(());
            }
            self.drain_stream(stream_id);
        }
        Ok(())
    }

    /// Reset a stream because of a peer violation and tell the application.
    fn reset_local(&mut self, stream_id: u32, error_code: ErrorCode) {
        self.reset_stream(stream_id, error_code);
        self.events.push_back(H2Event::StreamReset {
            stream_id,
            error_code,
        });
    }

    /// Forget a stream once both directions are closed.
    fn reap(&mut self, stream_id: u32) {
        if self.streams.get(&stream_id).is_some_and(|s| !s.can_send() && !s.can_recv()) {
            self.streams.remove(&stream_id);
        }
    }

    /// Release parked data on every blocked stream, lowest id first.
    fn drain_all(&mut self) {
        let mut blocked: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.pending.is_some())
            .map(|(&id, _)| id)
            .collect();
        blocked.sort_unstable();
        for stream_id in blocked {
            self.drain_stream(stream_id);
        }
    }

    /// Frame as much of a stream's parked data as the windows allow.
    fn drain_stream(&mut self, stream_id: u32) {
        let max_frame = self.remote_settings.max_frame_size as usize;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let Some(pending) = stream.pending.as_mut() else {
            return;
        };

        loop {
            if pending.data.is_empty() && !pending.end_stream {
                break;
            }
            let window = self
                .conn_send_window
                .available()
                .min(stream.send_window.available());
            let n = pending.data.len().min(max_frame).min(window);
            if n == 0 && !pending.data.is_empty() {
                return;
            }
            let payload: Vec<u8> = pending.data.drain(..n).collect();
            let last = pending.data.is_empty();
            // Both windows were checked above.
            let _ = self.conn_send_window.consume(n as u32);
            let _ = stream.send_window.consume(n as u32);
            Frame::Data {
                stream_id,
                payload,
                end_stream: last && pending.end_stream,
            }
            .encode(&mut self.send_buf);
            if last {
                break;
            }
        }

        let end_stream = pending.end_stream;
        stream.pending = None;
        if end_stream {
            stream.close_local();
            self.reap(stream_id);
        }
    }
}

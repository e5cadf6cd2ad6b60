//! Per-stream state for the server side of an HTTP/2 connection
//! (RFC 7540 Section 5.1).

use std::collections::VecDeque;

use crate::flowcontrol::Window;

/// Server-side stream states. Streams enter the table on their first
/// HEADERS, so `Idle` and the reserved states never appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

/// Response body bytes waiting for send window.
#[derive(Debug)]
pub(crate) struct PendingData {
    pub data: VecDeque<u8>,
    pub end_stream: bool,
}

pub(crate) struct H2Stream {
    pub state: StreamState,
    pub recv_window: Window,
    pub send_window: Window,
    /// Bytes of DATA received since the last stream WINDOW_UPDATE.
    pub unacked_recv: u32,
    /// Data parked until the peer opens the window.
    pub pending: Option<PendingData>,
}

impl H2Stream {
    pub fn new(recv_window: i64, send_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            recv_window: Window::new(recv_window),
            send_window: Window::new(send_window),
            unacked_recv: 0,
            pending: None,
        }
    }

    /// The peer finished sending on this stream.
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    /// We finished sending on this stream.
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        };
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

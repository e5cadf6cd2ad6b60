//! Sans-IO HTTP/2 server framing layer.
//!
//! The caller feeds bytes read from the transport via `recv()`, drains
//! per-stream events with `poll_event()`, answers streams with
//! `send_headers()` / `send_data()`, and pulls the resulting frames out via
//! `take_pending_send()`. Nothing in this crate touches a socket.
//!
//! # Architecture
//!
//! ```text
//!   TLS plaintext bytes
//!        |
//!   +----v----------+
//!   | helix-h2      |  HTTP/2 framing + HPACK + flow control
//!   | H2Connection  |  H2Event: StreamOpened, Headers, Data, HalfClosed, ...
//!   +---------------+
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use helix_h2::{H2Connection, H2Event, HeaderField, Settings};
//!
//! let mut h2 = H2Connection::server(Settings::server_default());
//!
//! // Server preface (SETTINGS) is queued immediately.
//! transport_send(&h2.take_pending_send());
//!
//! h2.recv(&received_data)?;
//! while let Some(event) = h2.poll_event() {
//!     if let H2Event::HalfClosed { stream_id } = event {
//!         h2.send_headers(stream_id, &[HeaderField::new(b":status", b"204")], true)?;
//!     }
//! }
//! transport_send(&h2.take_pending_send());
//! ```

pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
pub mod settings;
mod stream;

pub use connection::{CLIENT_PREFACE, H2Connection, H2Event};
pub use error::{ErrorCode, H2Error};
pub use frame::Frame;
pub use hpack::HeaderField;
pub use settings::Settings;

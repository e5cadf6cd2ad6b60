//! helix — readiness-driven TLS + HTTP/2 server engine.
//!
//! helix runs a single-threaded mio reactor. Each accepted socket goes
//! through a non-blocking rustls handshake that negotiates `h2` and selects
//! a certificate by SNI, then an adapter feeds the plaintext to the
//! [`helix_h2`] engine and answers completed requests with the caller's
//! [`Handler`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use helix::{ConfigBuilder, HandlerError, Request, Response, Server, TlsOptions};
//!
//! fn main() -> Result<(), helix::Error> {
//!     let config = ConfigBuilder::new(TlsOptions::from_pem_files("cert.pem", "key.pem"))
//!         .port(8443)
//!         .build()?;
//!     let mut server = Server::bind(config, |_req: &Request| -> Result<Response, HandlerError> {
//!         Ok(Response::new(200).body("TEST DATA"))
//!     })?;
//!     server.run()
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!   Reactor ──Accept──▶ Handshake ──Complete──▶ Connection ──▶ helix-h2
//!      ▲                   │                        │
//!      └──── reregister ◀──┴── NeedsRead/NeedsWrite ┴── Next::{Read,Write}
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod reactor;
pub mod request;
pub mod server;
pub mod stream;
pub mod tls;

// ── Re-exports: Server ──────────────────────────────────────────────────

/// Server configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Errors returned by helix.
pub use error::{Error, HandlerError};
/// Listener, session table and run loop.
pub use server::Server;
/// Handle for stopping a running server.
pub use server::ShutdownHandle;

// ── Re-exports: Handler types ───────────────────────────────────────────

/// Request handler trait, implemented for closures.
pub use request::Handler;
/// Header map with last-write-wins and cookie joining.
pub use request::Headers;
/// A complete request.
pub use request::Request;
/// A handler's answer.
pub use request::Response;

// ── Re-exports: TLS ─────────────────────────────────────────────────────

/// Certificate, key and trust-anchor sources.
pub use config::{CertSource, Curve, KeySource, SniCallback, SniOptions, TlsOptions, TlsVersion};
/// ALPN protocol id advertised by every configuration.
pub use tls::ALPN_H2;
/// Build a `rustls::ServerConfig` from [`TlsOptions`].
pub use tls::build_server_config;

// ── Re-exports: I/O engine ──────────────────────────────────────────────

/// Per-connection adapter and its readiness verdict.
pub use connection::{Connection, Next};
/// Non-blocking handshake and its progress states.
pub use handshake::{Handshake, HandshakeStatus};
/// Readiness multiplexer.
pub use reactor::{Continuation, Dispatch, Reactor};
/// Transport traits and the TLS stream.
pub use stream::{Socket, TlsStream, Transport};

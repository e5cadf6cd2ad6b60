use std::io;

use thiserror::Error;

/// Errors returned by the helix server.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or readiness-multiplexer operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// rustls rejected the configuration or the session.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// Certificate or key material could not be decoded.
    #[error("PEM error: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
    /// Trust anchors could not be turned into a client verifier.
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    /// A certificate or key source contained nothing usable.
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    /// A configured cipher suite name is not supported by the provider.
    #[error("unknown cipher suite: {0}")]
    UnknownCipherSuite(String),
    /// The peer did not offer `h2`.
    #[error("peer offered no supported application protocol")]
    NoApplicationProtocol,
    /// The peer closed the socket before the handshake finished.
    #[error("connection closed during handshake")]
    HandshakeClosed,
    /// Binding the listening socket failed.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// No free registration slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    Config(String),
    /// HTTP/2 connection error.
    #[error("HTTP/2 error: {0}")]
    H2(#[from] helix_h2::H2Error),
    /// The request handler failed, panicked or returned no `:status`.
    #[error("handler error: {0}")]
    Handler(HandlerError),
}

/// Error returned by a request handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

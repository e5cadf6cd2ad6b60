//! Non-blocking TLS accept state machine.
//!
//! A handshake starts by buffering the ClientHello in a rustls `Acceptor`.
//! Once it is complete the SNI selector picks a configuration and the
//! connection continues as a `ServerConnection` until rustls reports the
//! handshake finished. Each `step` runs as far as the socket allows and says
//! which readiness to wait for next.

use std::io;
use std::net::SocketAddr;

use rustls::ServerConnection;
use rustls::server::Acceptor;
use tracing::debug;

use crate::error::Error;
use crate::stream::{Socket, TlsStream};
use crate::tls::{Negotiation, Resolved, SniSelector, negotiate};

/// What a handshake needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedsRead,
    NeedsWrite,
    Complete,
}

enum Phase {
    ClientHello(Box<Acceptor>),
    Negotiating(Box<ServerConnection>),
    Failed,
}

pub struct Handshake<S: Socket> {
    socket: S,
    peer: Option<SocketAddr>,
    phase: Phase,
    resolved: Option<Resolved>,
    negotiation: Negotiation,
}

impl<S: Socket> Handshake<S> {
    pub fn new(socket: S) -> Self {
        let peer = socket.peer_addr().ok();
        Handshake {
            socket,
            peer,
            phase: Phase::ClientHello(Box::default()),
            resolved: None,
            negotiation: Negotiation::NotOffered,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Configuration chosen from the ClientHello, once it has been read.
    pub fn resolved(&self) -> Option<&Resolved> {
        self.resolved.as_ref()
    }

    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Advance the handshake as far as the socket allows.
    ///
    /// After an error the handshake is dead; the caller closes the socket.
    pub fn step(&mut self, selector: &mut SniSelector) -> Result<HandshakeStatus, Error> {
        let result = self.drive(selector);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn drive(&mut self, selector: &mut SniSelector) -> Result<HandshakeStatus, Error> {
        loop {
            match &mut self.phase {
                Phase::ClientHello(acceptor) => {
                    match acceptor.read_tls(&mut self.socket) {
                        Ok(0) => return Err(Error::HandshakeClosed),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(HandshakeStatus::NeedsRead);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    let accepted = match acceptor.accept() {
                        Ok(Some(accepted)) => accepted,
                        Ok(None) => continue,
                        Err((err, mut alert)) => {
                            let _ = alert.write_all(&mut self.socket);
                            return Err(tls_error(err));
                        }
                    };

                    let hello = accepted.client_hello();
                    let negotiation = negotiate(hello.alpn());
                    let server_name = hello.server_name().map(str::to_owned);
                    let resolved = selector.resolve(self.peer, server_name.as_deref())?;
                    debug!(
                        peer = ?self.peer,
                        server_name = server_name.as_deref().unwrap_or(""),
                        config = ?resolved,
                        ?negotiation,
                        "client hello"
                    );

                    let config = resolved.config().clone();
                    self.resolved = Some(resolved);
                    self.negotiation = negotiation;

                    match accepted.into_connection(config) {
                        Ok(conn) => self.phase = Phase::Negotiating(Box::new(conn)),
                        Err((err, mut alert)) => {
                            let _ = alert.write_all(&mut self.socket);
                            return Err(tls_error(err));
                        }
                    }
                }
                Phase::Negotiating(conn) => {
                    while conn.wants_write() {
                        match conn.write_tls(&mut self.socket) {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(HandshakeStatus::NeedsWrite);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }

                    if !conn.is_handshaking() {
                        if self.negotiation == Negotiation::Declined {
                            return Err(Error::NoApplicationProtocol);
                        }
                        return Ok(HandshakeStatus::Complete);
                    }

                    match conn.read_tls(&mut self.socket) {
                        Ok(0) => return Err(Error::HandshakeClosed),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(HandshakeStatus::NeedsRead);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if let Err(err) = conn.process_new_packets() {
                        // The alert is queued; send it if the socket takes it.
                        let _ = conn.write_tls(&mut self.socket);
                        return Err(tls_error(err));
                    }
                }
                Phase::Failed => return Err(Error::HandshakeClosed),
            }
        }
    }

    /// Established stream, or the handshake back when it is not complete.
    pub fn into_stream(self) -> Result<TlsStream<S>, Self> {
        match self.phase {
            Phase::Negotiating(conn) if !conn.is_handshaking() => {
                Ok(TlsStream::new(*conn, self.socket))
            }
            phase => Err(Handshake { phase, ..self }),
        }
    }

    /// Shut the socket down.
    pub fn close(&mut self) -> io::Result<()> {
        self.phase = Phase::Failed;
        self.socket.shutdown()
    }
}

fn tls_error(err: rustls::Error) -> Error {
    match err {
        rustls::Error::NoApplicationProtocol => Error::NoApplicationProtocol,
        err => Error::Tls(err),
    }
}

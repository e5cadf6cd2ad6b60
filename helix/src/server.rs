//! Listener, session table and reactor run loop.

use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{Connection, Next};
use crate::error::Error;
use crate::handshake::{Handshake, HandshakeStatus};
use crate::metrics;
use crate::reactor::{Continuation, Dispatch, Reactor};
use crate::request::Handler;
use crate::stream::TlsStream;
use crate::tls::{self, SniSelector};

/// Handle for stopping [`Server::run`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the server to stop. `run` closes every open connection and
    /// returns `Ok(())`.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        // Wake the reactor so it sees the flag even if blocked in poll.
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake reactor");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }
}

enum Session {
    Handshaking {
        token: Token,
        handshake: Handshake<TcpStream>,
    },
    Established {
        token: Token,
        connection: Connection<TlsStream<TcpStream>>,
    },
}

/// Everything dispatch needs besides the reactor itself.
struct Sessions {
    listener: TcpListener,
    table: Vec<Option<Session>>,
    selector: SniSelector,
    handler: Arc<dyn Handler>,
    h2: helix_h2::Settings,
    read_buffer_size: usize,
    max_request_body: usize,
    tcp_nodelay: bool,
    max_connections: usize,
    open: usize,
}

pub struct Server {
    reactor: Reactor,
    sessions: Sessions,
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener and build the default TLS configuration.
    pub fn bind(config: Config, handler: impl Handler) -> Result<Server, Error> {
        config.validate()?;
        let default = tls::build_server_config(&config.tls)?;

        let addr = format!("{}:{}", config.host, config.port);
        let bind_error = |source: io::Error| Error::Bind {
            addr: addr.clone(),
            source,
        };
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                ))
            })?;
        let mut listener = TcpListener::bind(socket_addr).map_err(bind_error)?;
        let local_addr = listener.local_addr()?;

        let mut reactor = Reactor::new(config.events_capacity, config.max_connections + 1)?;
        reactor.register(&mut listener, Interest::READABLE, Continuation::Accept)?;

        info!(addr = %local_addr, "listening");
        Ok(Server {
            reactor,
            sessions: Sessions {
                listener,
                table: Vec::new(),
                selector: SniSelector::new(default, config.sni),
                handler: Arc::new(handler),
                h2: config.h2,
                read_buffer_size: config.read_buffer_size,
                max_request_body: config.max_request_body,
                tcp_nodelay: config.tcp_nodelay,
                max_connections: config.max_connections as usize,
                open: 0,
            },
            local_addr,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_flag: self.shutdown_flag.clone(),
            waker: self.reactor.waker(),
        }
    }

    /// Sockets currently handshaking or established.
    pub fn open_connections(&self) -> usize {
        self.sessions.open
    }

    /// Run one reactor cycle, waiting at most `timeout` for readiness.
    /// Returns the number of dispatches made.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.reactor.run(&mut self.sessions, timeout)
    }

    /// Serve until [`ShutdownHandle::shutdown`] is called. Errors from a
    /// single cycle are logged and the loop continues.
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.shutdown_flag.load(Ordering::Acquire) {
            if let Err(err) = self.run_once(None) {
                error!(%err, "reactor cycle failed");
            }
        }
        info!(open = self.sessions.open, "shutting down");
        self.sessions.close_all(&mut self.reactor);
        Ok(())
    }
}

impl Dispatch for Sessions {
    fn dispatch(
        &mut self,
        reactor: &mut Reactor,
        token: Token,
        continuation: Continuation,
    ) -> Result<(), Error> {
        match continuation {
            Continuation::Accept => self.accept(reactor, token),
            Continuation::Handshake => {
                self.advance_handshake(reactor, token);
                Ok(())
            }
            Continuation::Read | Continuation::Write => {
                self.drive(reactor, token, continuation);
                Ok(())
            }
        }
    }
}

impl Sessions {
    fn slot(&mut self, token: Token) -> &mut Option<Session> {
        let index = Reactor::slot_index(token);
        if index >= self.table.len() {
            self.table.resize_with(index + 1, || None);
        }
        &mut self.table[index]
    }

    /// Drain pending connections from the listener.
    fn accept(&mut self, reactor: &mut Reactor, listener: Token) -> Result<(), Error> {
        loop {
            let (mut socket, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(%e, "accept attempt failed");
                    continue;
                }
                Err(e) => {
                    // Connections may still be queued behind the failure and
                    // the listener will not fire again on its own.
                    warn!(%e, "accept failed, re-arming listener");
                    return reactor.reregister(
                        &mut self.listener,
                        listener,
                        Interest::READABLE,
                        Continuation::Accept,
                    );
                }
            };

            if self.open >= self.max_connections {
                metrics::CONNECTIONS_REJECTED.increment();
                warn!(%peer, limit = self.max_connections, "connection limit reached, closing");
                let _ = socket.shutdown(Shutdown::Both);
                continue;
            }
            if self.tcp_nodelay
                && let Err(err) = socket.set_nodelay(true)
            {
                debug!(%peer, %err, "failed to set TCP_NODELAY");
            }

            let token =
                match reactor.register(&mut socket, Interest::READABLE, Continuation::Handshake) {
                    Ok(token) => token,
                    Err(err) => {
                        warn!(%peer, %err, "failed to register connection");
                        continue;
                    }
                };
            metrics::CONNECTIONS_ACCEPTED.increment();
            metrics::CONNECTIONS_ACTIVE.increment();
            self.open += 1;
            info!(%peer, "connected");

            *self.slot(token) = Some(Session::Handshaking {
                token,
                handshake: Handshake::new(socket),
            });
            self.advance_handshake(reactor, token);
        }
    }

    fn advance_handshake(&mut self, reactor: &mut Reactor, token: Token) {
        let index = Reactor::slot_index(token);
        let Some(Some(Session::Handshaking { handshake, .. })) = self.table.get_mut(index) else {
            return;
        };
        match handshake.step(&mut self.selector) {
            Ok(HandshakeStatus::NeedsRead) => {
                self.rearm(reactor, token, Interest::READABLE, Continuation::Handshake)
            }
            Ok(HandshakeStatus::NeedsWrite) => {
                self.rearm(reactor, token, Interest::WRITABLE, Continuation::Handshake)
            }
            Ok(HandshakeStatus::Complete) => self.establish(reactor, token),
            Err(err) => {
                metrics::HANDSHAKES_FAILED.increment();
                warn!(peer = ?handshake.peer_addr(), %err, "handshake failed");
                self.close(reactor, token);
            }
        }
    }

    fn establish(&mut self, reactor: &mut Reactor, token: Token) {
        let slot = self.slot(token);
        let Some(Session::Handshaking { handshake, .. }) = slot.take() else {
            return;
        };
        let stream = match handshake.into_stream() {
            Ok(stream) => stream,
            Err(handshake) => {
                *slot = Some(Session::Handshaking { token, handshake });
                self.close(reactor, token);
                return;
            }
        };

        metrics::HANDSHAKES_COMPLETED.increment();
        debug!(
            peer = ?stream.socket().peer_addr().ok(),
            alpn = ?stream.alpn_protocol().map(String::from_utf8_lossy),
            server_name = stream.server_name().unwrap_or(""),
            "handshake complete"
        );
        let connection = Connection::new(
            stream,
            self.h2.clone(),
            self.handler.clone(),
            self.read_buffer_size,
        )
        .with_max_request_body(self.max_request_body);
        *self.slot(token) = Some(Session::Established { token, connection });
        // Plaintext may already be buffered; run the read path now.
        self.drive(reactor, token, Continuation::Read);
    }

    fn drive(&mut self, reactor: &mut Reactor, token: Token, continuation: Continuation) {
        let index = Reactor::slot_index(token);
        let Some(Some(Session::Established { connection, .. })) = self.table.get_mut(index) else {
            return;
        };
        let next = match continuation {
            Continuation::Write => connection.on_writable(),
            _ => connection.on_readable(),
        };
        match next {
            Next::Read => self.rearm(reactor, token, Interest::READABLE, Continuation::Read),
            Next::Write => self.rearm(reactor, token, Interest::WRITABLE, Continuation::Write),
            Next::Close => self.close(reactor, token),
        }
    }

    /// Point a registration at a new continuation. The poller is
    /// edge-triggered and every path drains before getting here, so an
    /// unchanged registration needs no syscall.
    fn rearm(
        &mut self,
        reactor: &mut Reactor,
        token: Token,
        interest: Interest,
        continuation: Continuation,
    ) {
        if reactor.continuation(token) == Some(continuation)
            && reactor.interest(token) == Some(interest)
        {
            return;
        }
        let result = match self.slot(token) {
            Some(Session::Handshaking { handshake, .. }) => {
                reactor.reregister(handshake.socket_mut(), token, interest, continuation)
            }
            Some(Session::Established { connection, .. }) => reactor.reregister(
                connection.transport_mut().socket_mut(),
                token,
                interest,
                continuation,
            ),
            None => return,
        };
        if let Err(err) = result {
            warn!(token = token.0, %err, "failed to re-arm registration");
            self.close(reactor, token);
        }
    }

    /// Deregister, then close. Safe to call for an already-closed slot.
    fn close(&mut self, reactor: &mut Reactor, token: Token) {
        let Some(session) = self.slot(token).take() else {
            return;
        };
        match session {
            Session::Handshaking {
                token,
                mut handshake,
            } => {
                if let Err(err) = reactor.deregister(handshake.socket_mut(), token) {
                    debug!(%err, "deregister failed");
                }
                if let Err(err) = handshake.close() {
                    debug!(peer = ?handshake.peer_addr(), %err, "socket shutdown");
                }
            }
            Session::Established {
                token,
                mut connection,
            } => {
                if let Err(err) = reactor.deregister(connection.transport_mut().socket_mut(), token)
                {
                    debug!(%err, "deregister failed");
                }
                connection.teardown();
            }
        }
        self.open -= 1;
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    fn close_all(&mut self, reactor: &mut Reactor) {
        let tokens: Vec<Token> = self
            .table
            .iter()
            .flatten()
            .map(|session| match session {
                Session::Handshaking { token, .. } | Session::Established { token, .. } => *token,
            })
            .collect();
        for token in tokens {
            self.close(reactor, token);
        }
    }
}

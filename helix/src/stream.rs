//! Byte transports under the connection adapter.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use rustls::ServerConnection;

/// A non-blocking byte socket.
pub trait Socket: Read + Write {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn shutdown(&self) -> io::Result<()>;
}

impl Socket for mio::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Plaintext transport driven by the connection adapter.
///
/// `read` returns `Ok(0)` on clean close and `WouldBlock` when nothing is
/// available. `write` may accept fewer bytes than offered; `flush` pushes
/// out anything the transport buffered internally.
pub trait Transport: Read + Write {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    /// Whether buffered output is still waiting for the socket.
    fn wants_write(&self) -> bool;
    /// Close the transport. Called at most once.
    fn close(&mut self) -> io::Result<()>;
}

/// TLS session over a non-blocking socket.
pub struct TlsStream<S: Socket> {
    conn: ServerConnection,
    socket: S,
}

impl<S: Socket> TlsStream<S> {
    pub fn new(conn: ServerConnection, socket: S) -> Self {
        TlsStream { conn, socket }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    /// Write queued ciphertext until done or the socket blocks.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.socket)? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }
}

impl<S: Socket> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                // Ok(0) is the peer's close_notify.
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.read_tls(&mut self.socket)? == 0 {
                return Ok(0);
            }
            if let Err(err) = self.conn.process_new_packets() {
                // Push out the alert rustls queued for this error.
                let _ = self.flush_tls();
                return Err(io::Error::new(io::ErrorKind::InvalidData, err));
            }
            // Post-handshake records (tickets, key updates) may be queued.
            match self.flush_tls() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: Socket> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut accepted = self.conn.writer().write(buf)?;
        if accepted == 0 {
            // Plaintext buffer full; drain ciphertext to make room.
            self.flush_tls()?;
            accepted = self.conn.writer().write(buf)?;
            if accepted == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }
        match self.flush_tls() {
            Ok(()) => Ok(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(accepted),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_tls()?;
        self.socket.flush()
    }
}

impl<S: Socket> Transport for TlsStream<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        // Best effort: the peer may already be gone.
        let _ = self.flush_tls();
        self.socket.shutdown()
    }
}

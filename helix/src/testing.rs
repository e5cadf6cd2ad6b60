//! In-memory sockets and rustls client helpers for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::{CertSource, KeySource, TlsOptions};
use crate::stream::Socket;

#[derive(Default)]
struct Half {
    buf: VecDeque<u8>,
    closed: bool,
    /// Bytes that may sit unread before writes block. `None` = unbounded.
    capacity: Option<usize>,
}

/// One end of an in-memory socket pair. Reads return `WouldBlock` while the
/// other end has written nothing and not shut down.
pub struct MemSocket {
    rx: Rc<RefCell<Half>>,
    tx: Rc<RefCell<Half>>,
    peer: SocketAddr,
}

/// (server end, client end)
pub fn socket_pair() -> (MemSocket, MemSocket) {
    let a = Rc::new(RefCell::new(Half::default()));
    let b = Rc::new(RefCell::new(Half::default()));
    let server = MemSocket {
        rx: a.clone(),
        tx: b.clone(),
        peer: "127.0.0.1:50000".parse().unwrap(),
    };
    let client = MemSocket {
        rx: b,
        tx: a,
        peer: "127.0.0.1:8443".parse().unwrap(),
    };
    (server, client)
}

impl MemSocket {
    /// Shut down this end's sending direction.
    pub fn close_write(&self) {
        self.tx.borrow_mut().closed = true;
    }

    /// Whether the other end has shut down.
    pub fn peer_closed(&self) -> bool {
        self.rx.borrow().closed
    }

    /// Bound the bytes the other end may have in flight towards this one.
    /// Its writes accept only what fits and block while the buffer is full.
    pub fn set_recv_capacity(&self, capacity: Option<usize>) {
        self.rx.borrow_mut().capacity = capacity;
    }
}

impl Read for MemSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut half = self.rx.borrow_mut();
        if half.buf.is_empty() {
            return if half.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(half.buf.len());
        for (dst, src) in buf.iter_mut().zip(half.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut half = self.tx.borrow_mut();
        if half.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match half.capacity {
            Some(cap) => buf.len().min(cap.saturating_sub(half.buf.len())),
            None => buf.len(),
        };
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        half.buf.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MemSocket {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.close_write();
        Ok(())
    }
}

/// Self-signed server material for `name`.
pub struct TestCert {
    pub options: TlsOptions,
    pub der: CertificateDer<'static>,
}

pub fn test_cert(name: &str) -> TestCert {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    TestCert {
        options: TlsOptions::new(
            CertSource::Pem(cert.cert.pem().into_bytes()),
            KeySource::Pem(cert.key_pair.serialize_pem().into_bytes()),
        ),
        der: cert.cert.der().clone(),
    }
}

pub fn client_config(trusted: &[&CertificateDer<'static>], alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in trusted {
        roots.add((*cert).clone()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

pub fn client(config: Arc<ClientConfig>, name: &str) -> ClientConnection {
    ClientConnection::new(config, name.to_string().try_into().unwrap()).unwrap()
}

/// Move client records onto the socket and process whatever the server sent.
pub fn pump_client(client: &mut ClientConnection, sock: &mut MemSocket) -> Result<(), rustls::Error> {
    while client.wants_write() {
        client.write_tls(sock).unwrap();
    }
    loop {
        match client.read_tls(sock) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                client.process_new_packets()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => panic!("client read_tls: {e}"),
        }
    }
}

/// Read all plaintext currently available to the client.
pub fn client_plaintext(client: &mut ClientConnection) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match client.reader().read(&mut buf) {
            Ok(0) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return out,
            Err(e) => panic!("client read: {e}"),
        }
    }
}

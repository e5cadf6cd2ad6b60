//! Readiness multiplexer.
//!
//! Wraps a `mio::Poll` and a registration table. Each registered socket owns
//! exactly one slot {interest, continuation, generation}; interest changes
//! mutate the slot in place. Tokens encode the slot index in the low 24 bits
//! and the slot generation above it, so readiness for a recycled slot is
//! recognised as stale and dropped.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{error, trace};

use crate::error::Error;
use crate::metrics;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Token reserved for the cross-thread waker. Its index bits are all ones,
/// which no slot can reach.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// What to run when a registration becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Drain `accept()` on the listener.
    Accept,
    /// Advance a TLS handshake.
    Handshake,
    /// Read from an established connection.
    Read,
    /// Flush queued output on an established connection.
    Write,
}

/// Receives readiness dispatches from [`Reactor::run`].
pub trait Dispatch {
    /// Handle one ready registration. May register, reregister or deregister
    /// any socket, including the one being dispatched.
    fn dispatch(
        &mut self,
        reactor: &mut Reactor,
        token: Token,
        continuation: Continuation,
    ) -> Result<(), Error>;
}

struct Registration {
    interest: Interest,
    continuation: Continuation,
    generation: u32,
    active: bool,
}

impl Registration {
    fn vacant() -> Self {
        Registration {
            interest: Interest::READABLE,
            continuation: Continuation::Read,
            generation: 0,
            active: false,
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Vec<Registration>,
    /// Indices in reverse order so pop gives lowest first.
    free_list: Vec<u32>,
    ready: Vec<Token>,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Create a reactor fetching up to `capacity` events per poll, with room
    /// for `max_registrations` sockets.
    pub fn new(capacity: usize, max_registrations: u32) -> Result<Self, Error> {
        if max_registrations as usize > INDEX_MASK {
            return Err(Error::Config(
                "max_registrations must be < 2^24".into(),
            ));
        }
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let slots = (0..max_registrations).map(|_| Registration::vacant()).collect();
        Ok(Reactor {
            poll,
            events: Events::with_capacity(capacity),
            slots,
            free_list: (0..max_registrations).rev().collect(),
            ready: Vec::with_capacity(capacity),
            waker,
        })
    }

    /// Waker that interrupts a blocked [`run`](Self::run) from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Slot index encoded in a token. Stable for the life of the registration.
    pub fn slot_index(token: Token) -> usize {
        token.0 & INDEX_MASK
    }

    fn token_for(index: u32, generation: u32) -> Token {
        Token(((generation as usize) << INDEX_BITS) | index as usize)
    }

    fn slot(&self, token: Token) -> Option<&Registration> {
        let index = Self::slot_index(token);
        self.slots
            .get(index)
            .filter(|r| r.active && Self::token_for(index as u32, r.generation) == token)
    }

    fn slot_mut(&mut self, token: Token) -> Option<&mut Registration> {
        let index = Self::slot_index(token);
        self.slots
            .get_mut(index)
            .filter(|r| r.active && Self::token_for(index as u32, r.generation) == token)
    }

    /// Register a socket. The returned token stays valid until `deregister`.
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
        continuation: Continuation,
    ) -> Result<Token, Error> {
        let index = self.free_list.pop().ok_or(Error::ConnectionLimitReached)?;
        let slot = &mut self.slots[index as usize];
        let token = Self::token_for(index, slot.generation);
        if let Err(e) = self.poll.registry().register(source, token, interest) {
            self.free_list.push(index);
            return Err(e.into());
        }
        slot.interest = interest;
        slot.continuation = continuation;
        slot.active = true;
        trace!(token = token.0, ?interest, ?continuation, "registered");
        Ok(token)
    }

    /// Change a registration's interest and continuation in place.
    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        continuation: Continuation,
    ) -> Result<(), Error> {
        let registry = self.poll.registry();
        let index = Self::slot_index(token);
        let slot = self
            .slots
            .get_mut(index)
            .filter(|r| r.active && Self::token_for(index as u32, r.generation) == token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "stale reactor token"))?;
        // Re-arming matters even when the interest is unchanged: the poller is
        // edge-triggered.
        registry.reregister(source, token, interest)?;
        slot.interest = interest;
        slot.continuation = continuation;
        Ok(())
    }

    /// Remove a registration. Removing a stale or already-removed token is a
    /// no-op.
    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> Result<(), Error> {
        let Some(slot) = self.slot_mut(token) else {
            return Ok(());
        };
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(Self::slot_index(token) as u32);
        trace!(token = token.0, "deregistered");
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Continuation for a live registration; `None` for stale tokens.
    pub fn continuation(&self, token: Token) -> Option<Continuation> {
        self.slot(token).map(|r| r.continuation)
    }

    /// Interest of a live registration; `None` for stale tokens.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.slot(token).map(|r| r.interest)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for readiness and dispatch every ready registration once.
    ///
    /// The continuation is looked up at dispatch time, so a registration
    /// removed by an earlier dispatch in the same batch is skipped. A
    /// dispatch error is logged and counted; the rest of the batch still
    /// runs. Returns the number of dispatches made.
    pub fn run<D: Dispatch + ?Sized>(
        &mut self,
        target: &mut D,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|e| e.token()));

        let mut dispatched = 0;
        for &token in &ready {
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(continuation) = self.continuation(token) else {
                trace!(token = token.0, "stale readiness skipped");
                continue;
            };
            dispatched += 1;
            if let Err(err) = target.dispatch(self, token, continuation) {
                metrics::DISPATCH_ERRORS.increment();
                error!(token = token.0, ?continuation, %err, "dispatch failed");
            }
        }

        self.ready = ready;
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::net::TcpStream as StdStream;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn reregister_mutates_in_place() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        let mut l = listener();
        let token = reactor
            .register(&mut l, Interest::READABLE, Continuation::Accept)
            .unwrap();
        reactor
            .reregister(&mut l, token, Interest::WRITABLE, Continuation::Write)
            .unwrap();
        assert_eq!(reactor.len(), 1);
        assert_eq!(reactor.continuation(token), Some(Continuation::Write));
        assert_eq!(reactor.interest(token), Some(Interest::WRITABLE));
    }

    #[test]
    fn deregister_is_idempotent_and_tokens_go_stale() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        let mut l = listener();
        let token = reactor
            .register(&mut l, Interest::READABLE, Continuation::Accept)
            .unwrap();
        reactor.deregister(&mut l, token).unwrap();
        reactor.deregister(&mut l, token).unwrap();
        assert!(reactor.is_empty());
        assert_eq!(reactor.continuation(token), None);

        // Same slot, new generation.
        let mut l2 = listener();
        let token2 = reactor
            .register(&mut l2, Interest::READABLE, Continuation::Accept)
            .unwrap();
        assert_eq!(Reactor::slot_index(token), Reactor::slot_index(token2));
        assert_ne!(token, token2);
        assert_eq!(reactor.continuation(token), None);
        assert!(
            reactor
                .reregister(&mut l2, token, Interest::WRITABLE, Continuation::Write)
                .is_err()
        );
    }

    #[test]
    fn table_full_is_reported() {
        let mut reactor = Reactor::new(16, 1).unwrap();
        let mut a = listener();
        let mut b = listener();
        reactor
            .register(&mut a, Interest::READABLE, Continuation::Accept)
            .unwrap();
        assert!(matches!(
            reactor.register(&mut b, Interest::READABLE, Continuation::Accept),
            Err(Error::ConnectionLimitReached)
        ));
    }

    /// Deregisters every listener on its first dispatch.
    struct DropAll {
        listeners: Vec<(TcpListener, Token)>,
        calls: usize,
    }

    impl Dispatch for DropAll {
        fn dispatch(
            &mut self,
            reactor: &mut Reactor,
            _token: Token,
            continuation: Continuation,
        ) -> Result<(), Error> {
            assert_eq!(continuation, Continuation::Accept);
            self.calls += 1;
            for (l, t) in &mut self.listeners {
                reactor.deregister(l, *t)?;
            }
            Ok(())
        }
    }

    #[test]
    fn registrations_removed_mid_batch_are_skipped() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        let mut target = DropAll {
            listeners: Vec::new(),
            calls: 0,
        };
        let mut clients = Vec::new();
        for _ in 0..2 {
            let mut l = listener();
            let t = reactor
                .register(&mut l, Interest::READABLE, Continuation::Accept)
                .unwrap();
            clients.push(StdStream::connect(l.local_addr().unwrap()).unwrap());
            target.listeners.push((l, t));
        }

        let dispatched = reactor
            .run(&mut target, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(target.calls, 1);
    }

    struct Failing(usize);

    impl Dispatch for Failing {
        fn dispatch(&mut self, _: &mut Reactor, _: Token, _: Continuation) -> Result<(), Error> {
            self.0 += 1;
            Err(Error::HandshakeClosed)
        }
    }

    #[test]
    fn dispatch_error_does_not_abort_run() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        let mut l = listener();
        reactor
            .register(&mut l, Interest::READABLE, Continuation::Accept)
            .unwrap();
        let _client = StdStream::connect(l.local_addr().unwrap()).unwrap();
        let mut target = Failing(0);
        assert_eq!(
            reactor
                .run(&mut target, Some(Duration::from_secs(5)))
                .unwrap(),
            1
        );
        assert_eq!(target.0, 1);
    }

    #[test]
    fn rearm_redelivers_pending_readiness() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        let mut l = listener();
        let token = reactor
            .register(&mut l, Interest::READABLE, Continuation::Accept)
            .unwrap();
        let _client = StdStream::connect(l.local_addr().unwrap()).unwrap();
        let mut target = Failing(0);
        let timeout = Some(Duration::from_secs(5));
        assert_eq!(reactor.run(&mut target, timeout).unwrap(), 1);

        // Nothing accepted: no new edge until the listener is re-armed.
        assert_eq!(
            reactor
                .run(&mut target, Some(Duration::from_millis(50)))
                .unwrap(),
            0
        );
        reactor
            .reregister(&mut l, token, Interest::READABLE, Continuation::Accept)
            .unwrap();
        assert_eq!(reactor.run(&mut target, timeout).unwrap(), 1);
        assert_eq!(target.0, 2);
    }

    #[test]
    fn waker_interrupts_poll_without_dispatch() {
        let mut reactor = Reactor::new(16, 4).unwrap();
        reactor.waker().wake().unwrap();
        let mut target = Failing(0);
        assert_eq!(
            reactor
                .run(&mut target, Some(Duration::from_secs(5)))
                .unwrap(),
            0
        );
        assert_eq!(target.0, 0);
    }
}

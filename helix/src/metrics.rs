//! helix runtime metrics.
//!
//! Process-wide counters for connections, handshakes, bytes and streams.
//! Registered with metriken so any exposition layer can scrape them.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "helix/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "helix/connections/rejected",
    description = "Connections closed at accept because the table was full"
)]
pub static CONNECTIONS_REJECTED: Counter = Counter::new();

#[metric(
    name = "helix/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "helix/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Handshakes ───────────────────────────────────────────────────

#[metric(
    name = "helix/handshakes/completed",
    description = "TLS handshakes that negotiated h2"
)]
pub static HANDSHAKES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "helix/handshakes/failed",
    description = "TLS handshakes that ended in an error"
)]
pub static HANDSHAKES_FAILED: Counter = Counter::new();

#[metric(
    name = "helix/sni/cache_miss",
    description = "SNI lookups that built a new configuration"
)]
pub static SNI_CACHE_MISSES: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "helix/bytes/received", description = "Plaintext bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "helix/bytes/sent", description = "Plaintext bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Streams ──────────────────────────────────────────────────────

#[metric(
    name = "helix/streams/completed",
    description = "Requests answered by the handler"
)]
pub static STREAMS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "helix/streams/body_limit",
    description = "Streams reset because the request body exceeded the limit"
)]
pub static STREAMS_BODY_LIMIT: Counter = Counter::new();

#[metric(
    name = "helix/handler/errors",
    description = "Handler errors and panics"
)]
pub static HANDLER_ERRORS: Counter = Counter::new();

#[metric(
    name = "helix/reactor/dispatch_errors",
    description = "Errors returned from a readiness dispatch"
)]
pub static DISPATCH_ERRORS: Counter = Counter::new();

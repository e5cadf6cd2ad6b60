//! HTTP/2 demo server answering every request with "TEST DATA".
//!
//! ```text
//! TLS_CERT=cert.pem TLS_KEY=key.pem RUST_LOG=debug cargo run --example h2_server -- 0.0.0.0 8443
//! curl -k --http2 https://localhost:8443/
//! ```

use helix::{ConfigBuilder, HandlerError, Request, Response, Server, TlsOptions};
use tracing_subscriber::EnvFilter;

fn handle(req: &Request) -> Result<Response, HandlerError> {
    tracing::info!(
        stream_id = req.stream_id,
        method = req.method().unwrap_or("-"),
        path = req.path().unwrap_or("-"),
        "request"
    );
    Ok(Response::new(200)
        .header("content-type", "text/plain")
        .body("TEST DATA"))
}

fn main() -> Result<(), helix::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port
            .parse()
            .map_err(|_| helix::Error::Config(format!("invalid port: {port}")))?,
        None => 8443,
    };

    let cert = std::env::var("TLS_CERT").unwrap_or_else(|_| "cert.pem".into());
    let key = std::env::var("TLS_KEY").unwrap_or_else(|_| "key.pem".into());

    let config = ConfigBuilder::new(TlsOptions::from_pem_files(cert, key))
        .host(host)
        .port(port)
        .build()?;
    Server::bind(config, handle)?.run()
}

//! TLS context construction and SNI-based configuration selection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::crypto::ring::{ALL_CIPHER_SUITES, kx_group};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use tracing::{debug, warn};

use crate::config::{CertSource, Curve, KeySource, SniCallback, SniOptions, TlsOptions, TlsVersion};
use crate::error::Error;
use crate::metrics;

/// The only application protocol the server speaks.
pub const ALPN_H2: &[u8] = b"h2";

/// Build a server configuration from options. ALPN is always exactly `h2`.
pub fn build_server_config(opts: &TlsOptions) -> Result<Arc<ServerConfig>, Error> {
    let mut chain = load_certs(&opts.cert)?;
    for extra in &opts.extra_chain_cert {
        chain.extend(load_certs(extra)?);
    }
    let key = load_key(&opts.key)?;

    let provider = Arc::new(crypto_provider(opts)?);
    let versions: Vec<&'static SupportedProtocolVersion> = match &opts.versions {
        Some(list) => list.iter().map(|v| protocol_version(*v)).collect(),
        None => vec![&rustls::version::TLS13, &rustls::version::TLS12],
    };
    let builder =
        ServerConfig::builder_with_provider(provider.clone()).with_protocol_versions(&versions)?;

    let builder = match load_trust_anchors(opts)? {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(chain, key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

fn protocol_version(version: TlsVersion) -> &'static SupportedProtocolVersion {
    match version {
        TlsVersion::Tls12 => &rustls::version::TLS12,
        TlsVersion::Tls13 => &rustls::version::TLS13,
    }
}

fn crypto_provider(opts: &TlsOptions) -> Result<CryptoProvider, Error> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(names) = &opts.ciphers {
        provider.cipher_suites = names
            .iter()
            .map(|name| find_cipher_suite(name))
            .collect::<Result<_, _>>()?;
    }
    provider.kx_groups = opts
        .curves
        .iter()
        .map(|curve| match curve {
            Curve::P256 => kx_group::SECP256R1,
            Curve::X25519 => kx_group::X25519,
            Curve::P384 => kx_group::SECP384R1,
        })
        .collect();
    Ok(provider)
}

/// Look up a cipher suite by its IANA-style name, case-insensitively.
fn find_cipher_suite(name: &str) -> Result<SupportedCipherSuite, Error> {
    ALL_CIPHER_SUITES
        .iter()
        .copied()
        .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownCipherSuite(name.to_string()))
}

fn load_certs(source: &CertSource) -> Result<Vec<CertificateDer<'static>>, Error> {
    let (certs, origin) = match source {
        CertSource::Path(path) => (
            CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?,
            path.display().to_string(),
        ),
        CertSource::Pem(bytes) => (
            CertificateDer::pem_slice_iter(bytes).collect::<Result<Vec<_>, _>>()?,
            "PEM bytes".to_string(),
        ),
        CertSource::Der(certs) => (certs.clone(), "DER list".to_string()),
    };
    if certs.is_empty() {
        return Err(Error::NoCertificate(origin));
    }
    Ok(certs)
}

fn load_key(source: &KeySource) -> Result<PrivateKeyDer<'static>, Error> {
    Ok(match source {
        KeySource::Path(path) => PrivateKeyDer::from_pem_file(path)?,
        KeySource::Pem(bytes) => PrivateKeyDer::from_pem_slice(bytes)?,
        KeySource::Der(key) => key.clone_key(),
    })
}

/// Trust anchors from `ca_file` and every readable PEM file in `ca_path`.
/// `None` when neither is configured.
fn load_trust_anchors(opts: &TlsOptions) -> Result<Option<RootCertStore>, Error> {
    if opts.ca_file.is_none() && opts.ca_path.is_none() {
        return Ok(None);
    }
    let mut roots = RootCertStore::empty();
    if let Some(file) = &opts.ca_file {
        add_pem_file(&mut roots, file)?;
    }
    if let Some(dir) = &opts.ca_path {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            // Hash links and unrelated files may share the directory.
            if let Err(err) = add_pem_file(&mut roots, &path) {
                debug!(path = %path.display(), %err, "skipping CA file");
            }
        }
    }
    if roots.is_empty() {
        let origin = opts
            .ca_file
            .as_ref()
            .or(opts.ca_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        return Err(Error::NoCertificate(origin));
    }
    Ok(Some(roots))
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> Result<(), Error> {
    for cert in CertificateDer::pem_file_iter(path)? {
        roots.add(cert?)?;
    }
    Ok(())
}

/// Outcome of ALPN negotiation for one ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The peer offered `h2`.
    Selected(&'static [u8]),
    /// The peer offered protocols, none of them `h2`. The handshake fails.
    Declined,
    /// The peer sent no ALPN extension.
    NotOffered,
}

/// Select `h2` from the protocols a peer offered.
pub fn negotiate<'a, I>(offered: Option<I>) -> Negotiation
where
    I: IntoIterator<Item = &'a [u8]>,
{
    match offered {
        None => Negotiation::NotOffered,
        Some(protocols) => {
            if protocols.into_iter().any(|p| p == ALPN_H2) {
                Negotiation::Selected(ALPN_H2)
            } else {
                Negotiation::Declined
            }
        }
    }
}

/// Configuration chosen for one handshake.
#[derive(Clone)]
pub enum Resolved {
    /// The listener's default configuration.
    Default(Arc<ServerConfig>),
    /// A configuration selected for the requested hostname.
    Named {
        hostname: String,
        config: Arc<ServerConfig>,
    },
}

impl Resolved {
    pub fn config(&self) -> &Arc<ServerConfig> {
        match self {
            Resolved::Default(config) | Resolved::Named { config, .. } => config,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Resolved::Default(_) => None,
            Resolved::Named { hostname, .. } => Some(hostname),
        }
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolved::Default(_) => f.write_str("Default"),
            Resolved::Named { hostname, .. } => write!(f, "Named({hostname})"),
        }
    }
}

/// Chooses the configuration for a handshake from the SNI hostname.
///
/// Resolution order: the caller callback when one is set (its `None` means
/// the default), then the cache, then building from per-host options, then
/// the default. Built configurations are cached for the life of the
/// selector; failed builds are not.
pub struct SniSelector {
    default: Arc<ServerConfig>,
    hosts: HashMap<String, TlsOptions>,
    cache: HashMap<String, Arc<ServerConfig>>,
    callback: Option<SniCallback>,
    /// h2-only copies of callback configurations, keyed by the original's
    /// address. The original is held so the address stays unique.
    forced_alpn: HashMap<usize, (Arc<ServerConfig>, Arc<ServerConfig>)>,
}

impl SniSelector {
    pub fn new(default: Arc<ServerConfig>, options: SniOptions) -> Self {
        let hosts = options
            .hosts
            .into_iter()
            .map(|(name, opts)| (normalize(&name), opts))
            .collect();
        SniSelector {
            default,
            hosts,
            cache: HashMap::new(),
            callback: options.callback,
            forced_alpn: HashMap::new(),
        }
    }

    pub fn default_config(&self) -> &Arc<ServerConfig> {
        &self.default
    }

    /// Cached configuration for a hostname, if it has been built.
    pub fn cached(&self, hostname: &str) -> Option<&Arc<ServerConfig>> {
        self.cache.get(&normalize(hostname))
    }

    pub fn resolve(
        &mut self,
        peer: Option<SocketAddr>,
        server_name: Option<&str>,
    ) -> Result<Resolved, Error> {
        let Some(name) = server_name else {
            return Ok(Resolved::Default(self.default.clone()));
        };
        let hostname = normalize(name);

        if let Some(callback) = self.callback.clone() {
            return Ok(match callback(peer, &hostname) {
                Some(config) => Resolved::Named {
                    config: self.h2_only(config),
                    hostname,
                },
                None => Resolved::Default(self.default.clone()),
            });
        }

        if let Some(config) = self.cache.get(&hostname) {
            return Ok(Resolved::Named {
                hostname,
                config: config.clone(),
            });
        }

        if let Some(opts) = self.hosts.get(&hostname) {
            let config = build_server_config(opts).inspect_err(|err| {
                warn!(%hostname, %err, "failed to build SNI configuration");
            })?;
            metrics::SNI_CACHE_MISSES.increment();
            debug!(%hostname, "cached SNI configuration");
            self.cache.insert(hostname.clone(), config.clone());
            return Ok(Resolved::Named { hostname, config });
        }

        Ok(Resolved::Default(self.default.clone()))
    }

    /// Callback-supplied configurations still advertise only `h2`. The
    /// rewritten copy is reused for as long as the callback keeps the
    /// original alive.
    fn h2_only(&mut self, config: Arc<ServerConfig>) -> Arc<ServerConfig> {
        if config.alpn_protocols.len() == 1 && config.alpn_protocols[0] == ALPN_H2 {
            return config;
        }
        let key = Arc::as_ptr(&config) as usize;
        if let Some((_, forced)) = self.forced_alpn.get(&key) {
            return forced.clone();
        }
        // Drop copies whose original only this map still owns.
        self.forced_alpn
            .retain(|_, (original, _)| Arc::strong_count(original) > 1);
        let mut forced = (*config).clone();
        forced.alpn_protocols = vec![ALPN_H2.to_vec()];
        let forced = Arc::new(forced);
        self.forced_alpn.insert(key, (config, forced.clone()));
        forced
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

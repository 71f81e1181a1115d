// SPDX-License-Identifier: AGPL-3.0-or-later
//! TLS certificates for the relay's HTTPS listener.
//!
//! The listener asks the provider for a certificate on every handshake, so
//! a refreshed certificate is picked up without a restart.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use log::{info, warn};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CertError, ConfigError, Error};
use crate::store::BlobStore;

pub const CERT_CACHE_KEY: &str = "cert-cache";

/// Age after which `refresh` issues a new certificate.
pub const RENEW_AFTER: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub trait CertificateProvider: Send + Sync {
    fn current_certificate(&self) -> Option<Arc<CertifiedKey>>;
    fn refresh(&self) -> Result<(), CertError>;
}

#[derive(Serialize, Deserialize)]
struct CachedCert {
    host: String,
    issued_at: u64,
    cert_der: String,
    key_der: String,
}

struct Issued {
    issued_at: u64,
    key: Arc<CertifiedKey>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn certified_key(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Arc<CertifiedKey>, CertError> {
    let signer = sign::any_supported_type(&PrivateKey(key_der))
        .map_err(|e| CertError::Key(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(vec![Certificate(cert_der)], signer)))
}

/// Self-signed certificate for `host` and `*.host`, cached in the blob store.
pub struct SelfSignedProvider {
    host: String,
    store: Arc<dyn BlobStore>,
    current: RwLock<Issued>,
}

impl SelfSignedProvider {
    pub fn new(host: &str, store: Arc<dyn BlobStore>) -> Result<Self, CertError> {
        let issued = match load_cache(host, store.as_ref()) {
            Ok(Some(issued)) => issued,
            Ok(None) => issue(host, store.as_ref())?,
            Err(e) => {
                warn!("discarding certificate cache: {}", e);
                issue(host, store.as_ref())?
            }
        };
        Ok(Self {
            host: host.to_string(),
            store,
            current: RwLock::new(issued),
        })
    }
}

impl CertificateProvider for SelfSignedProvider {
    fn current_certificate(&self) -> Option<Arc<CertifiedKey>> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Some(current.key.clone())
    }

    fn refresh(&self) -> Result<(), CertError> {
        let issued_at = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .issued_at;
        if unix_now().saturating_sub(issued_at) < RENEW_AFTER.as_secs() {
            return Ok(());
        }
        let fresh = issue(&self.host, self.store.as_ref())?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

fn load_cache(host: &str, store: &dyn BlobStore) -> Result<Option<Issued>, CertError> {
    let Some(raw) = store.get(CERT_CACHE_KEY)? else {
        return Ok(None);
    };
    let cached: CachedCert =
        serde_json::from_slice(&raw).map_err(|e| CertError::Cache(e.to_string()))?;
    if cached.host != host {
        info!("cached certificate is for {}, issuing one for {}", cached.host, host);
        return Ok(None);
    }
    let cert_der = STANDARD.decode(&cached.cert_der).map_err(|e| CertError::Cache(e.to_string()))?;
    let key_der = STANDARD.decode(&cached.key_der).map_err(|e| CertError::Cache(e.to_string()))?;
    Ok(Some(Issued {
        issued_at: cached.issued_at,
        key: certified_key(cert_der, key_der)?,
    }))
}

fn issue(host: &str, store: &dyn BlobStore) -> Result<Issued, CertError> {
    let cert = rcgen::generate_simple_self_signed(vec![host.to_string(), format!("*.{host}")])?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();
    let issued_at = unix_now();

    let cached = CachedCert {
        host: host.to_string(),
        issued_at,
        cert_der: STANDARD.encode(&cert_der),
        key_der: STANDARD.encode(&key_der),
    };
    let raw = serde_json::to_vec(&cached).map_err(|e| CertError::Cache(e.to_string()))?;
    store.set(CERT_CACHE_KEY, &raw)?;
    info!("issued self-signed certificate for {host} and *.{host}");

    Ok(Issued { issued_at, key: certified_key(cert_der, key_der)? })
}

/// Picks a provider by name. `none` disables TLS.
pub fn provider_for(
    name: &str,
    host: &str,
    store: Arc<dyn BlobStore>,
) -> Result<Option<Arc<dyn CertificateProvider>>, Error> {
    match name {
        "none" => Ok(None),
        "self-signed" => Ok(Some(Arc::new(SelfSignedProvider::new(host, store)?))),
        other => Err(ConfigError::UnsupportedProvider {
            kind: "certificate",
            name: other.to_string(),
        }
        .into()),
    }
}

/// Handshake callback: whatever the provider holds right now.
pub struct CertResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let key = self.provider.current_certificate();
        if key.is_none() {
            warn!("tls handshake refused: no certificate available");
        }
        key
    }
}

pub fn tls_config(provider: Arc<dyn CertificateProvider>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver { provider }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Calls `refresh` every `every`, logging failures.
pub async fn refresh_loop(provider: Arc<dyn CertificateProvider>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = provider.refresh() {
            warn!("certificate refresh failed: {}", e);
        }
    }
}

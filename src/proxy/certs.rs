//! SNI-keyed certificate cache backed by the `ssl_certs` table, with
//! wildcard fallback (`*.example.com` serves `foo.example.com`).

use arc_swap::ArcSwap;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct CertMap {
    exact: HashMap<String, Arc<CertifiedKey>>,
    wildcard: HashMap<String, Arc<CertifiedKey>>,
}

pub struct CertCache {
    inner: ArcSwap<CertMap>,
}

impl CertCache {
    pub fn new() -> Self {
        Self { inner: ArcSwap::from_pointee(CertMap::default()) }
    }

    pub async fn reload(&self, pool: &PgPool) -> anyhow::Result<()> {
        #[derive(sqlx::FromRow)]
        struct Row {
            name: String,
            cert_pem: String,
            key_pem: String,
        }
        let rows: Vec<Row> = sqlx::query_as("SELECT name, cert_pem, key_pem FROM ssl_certs").fetch_all(pool).await?;

        let mut map = CertMap::default();
        for row in rows {
            let key = match load_certified_key(&row.cert_pem, &row.key_pem) {
                Ok(k) => Arc::new(k),
                Err(e) => {
                    tracing::warn!(cert = %row.name, error = %e, "skipping unparseable certificate");
                    continue;
                }
            };
            if let Some(suffix) = row.name.strip_prefix("*.") {
                map.wildcard.insert(suffix.to_string(), key);
            } else {
                map.exact.insert(row.name, key);
            }
        }
        self.inner.store(Arc::new(map));
        Ok(())
    }

    pub fn lookup(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        let map = self.inner.load();
        if let Some(key) = map.exact.get(sni) {
            return Some(key.clone());
        }
        let (_, suffix) = sni.split_once('.')?;
        map.wildcard.get(suffix).cloned()
    }
}

impl Default for CertCache {
    fn default() -> Self {
        Self::new()
    }
}

fn load_certified_key(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in PEM");

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    let key_der: PrivatePkcs8KeyDer<'static> =
        keys.pop().ok_or_else(|| anyhow::anyhow!("no PKCS8 private key found in PEM"))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der.into())
        .map_err(|e| anyhow::anyhow!("unsupported private key: {e}"))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Wires the cache into `rustls`'s server config as the SNI resolver.
#[derive(Debug)]
pub struct SniResolver(pub Arc<CertCache>);

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.0.lookup(sni)
    }
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache").finish_non_exhaustive()
    }
}

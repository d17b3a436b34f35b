//! Certificate catalog and SNI-driven server certificate selection
//!
//! The catalog maps case-folded domains to ready-to-serve TLS credentials
//! and is consulted during the handshake's SNI callback. Matching order:
//! exact name, then the `*.parent` wildcard, then a self-signed fallback
//! generated at startup so the handshake always completes.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, warn};

use crate::db::CertRecord;

pub struct CertCatalog {
    certs: ArcSwap<HashMap<String, Arc<CertifiedKey>>>,
    fallback: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCatalog")
            .field("entries", &self.certs.load().len())
            .finish()
    }
}

impl CertCatalog {
    /// Create a catalog with a freshly generated self-signed fallback.
    pub fn new() -> Result<Self> {
        let fallback = generate_fallback_cert()?;
        Ok(Self {
            certs: ArcSwap::new(Arc::new(HashMap::new())),
            fallback,
        })
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self::new().expect("fallback certificate generation")
    }

    /// Replace the whole catalog from store rows. Rows with unparsable
    /// PEM material are skipped so one bad certificate cannot take down
    /// every vhost.
    pub fn rebuild(&self, records: &[CertRecord]) {
        let mut next = HashMap::with_capacity(records.len());
        for record in records {
            match load_certified_key(&record.chain_pem, &record.key_pem) {
                Ok(key) => {
                    next.insert(record.domain.to_lowercase(), Arc::new(key));
                }
                Err(e) => {
                    warn!(domain = %record.domain, error = %e, "Skipping unparsable certificate");
                }
            }
        }
        debug!(entries = next.len(), "Certificate catalog rebuilt");
        self.certs.store(Arc::new(next));
    }

    /// Install or replace one entry without waiting for a full rebuild
    /// (used right after a renewal lands).
    pub fn install(&self, domain: &str, chain_pem: &str, key_pem: &str) -> Result<()> {
        let key = Arc::new(load_certified_key(chain_pem, key_pem)?);
        let mut next: HashMap<_, _> = self.certs.load().as_ref().clone();
        next.insert(domain.to_lowercase(), key);
        self.certs.store(Arc::new(next));
        Ok(())
    }

    pub fn remove(&self, domain: &str) {
        let mut next: HashMap<_, _> = self.certs.load().as_ref().clone();
        if next.remove(&domain.to_lowercase()).is_some() {
            self.certs.store(Arc::new(next));
        }
    }

    /// Select the best credential for an SNI name:
    /// exact match, then wildcard, then the fallback.
    pub fn select(&self, server_name: &str) -> Arc<CertifiedKey> {
        let name = server_name.to_lowercase();
        let certs = self.certs.load();

        if let Some(key) = certs.get(&name) {
            return Arc::clone(key);
        }

        // a.b.c -> *.b.c; a bare label has no wildcard parent
        if let Some((_, parent)) = name.split_once('.') {
            if !parent.is_empty() {
                if let Some(key) = certs.get(&format!("*.{}", parent)) {
                    return Arc::clone(key);
                }
            }
        }

        Arc::clone(&self.fallback)
    }

    /// True if the name resolves to something other than the fallback
    pub fn has_match(&self, server_name: &str) -> bool {
        !Arc::ptr_eq(&self.select(server_name), &self.fallback)
    }

    /// rustls server configuration backed by this catalog
    pub fn server_config(self: &Arc<Self>) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        config
    }
}

impl ResolvesServerCert for CertCatalog {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or_default();
        Some(self.select(name))
    }
}

/// Parse PEM chain + key into a signing-ready credential
pub fn load_certified_key(chain_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid certificate chain PEM")?;
    if certs.is_empty() {
        anyhow::bail!("certificate chain PEM contains no certificates");
    }

    let key = load_private_key(key_pem.as_bytes())
        .ok_or_else(|| anyhow::anyhow!("no usable private key in PEM"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key: {}", e))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// The `notAfter` of the first certificate in a PEM chain, UNIX seconds
pub fn cert_expiry_unix(chain_pem: &str) -> Result<i64> {
    use x509_parser::prelude::*;

    let (_, pem) =
        x509_parser::pem::parse_x509_pem(chain_pem.as_bytes()).context("invalid PEM")?;
    let cert = pem.parse_x509().context("invalid X.509 certificate")?;
    Ok(cert.validity().not_after.timestamp())
}

fn generate_fallback_cert() -> Result<Arc<CertifiedKey>> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("fallback certificate generation failed")?;

    let key = load_certified_key(&cert.pem(), &key_pair.serialize_pem())?;
    Ok(Arc::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(domain: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn record(domain: &str) -> CertRecord {
        let (chain_pem, key_pem) = self_signed(domain);
        CertRecord {
            id: 0,
            domain: domain.to_string(),
            chain_pem,
            key_pem,
            expires_at: 0,
            dns_provider_id: None,
        }
    }

    #[test]
    fn test_exact_match_preferred() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("a.test"), record("*.test")]);

        assert!(catalog.has_match("a.test"));
        let exact = catalog.select("a.test");
        let wild = catalog.select("b.test");
        assert!(!Arc::ptr_eq(&exact, &wild));
    }

    #[test]
    fn test_wildcard_matches_single_label_only() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("*.apps.test")]);

        assert!(catalog.has_match("billing.apps.test"));
        // The registered parent itself is not covered
        assert!(!catalog.has_match("apps.test"));
        // Nor are two-label subdomains
        assert!(!catalog.has_match("a.b.apps.test"));
    }

    #[test]
    fn test_unknown_name_gets_fallback() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("a.test")]);

        let fallback = catalog.select("unknown.example");
        let fallback2 = catalog.select("");
        assert!(Arc::ptr_eq(&fallback, &fallback2));
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("a.test")]);
        assert!(catalog.has_match("A.TEST"));
    }

    #[test]
    fn test_install_replaces_single_entry() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("a.test")]);
        let before = catalog.select("a.test");

        let (chain, key) = self_signed("a.test");
        catalog.install("a.test", &chain, &key).unwrap();
        let after = catalog.select("a.test");

        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_remove_falls_back() {
        let catalog = CertCatalog::new().unwrap();
        catalog.rebuild(&[record("a.test")]);
        assert!(catalog.has_match("a.test"));

        catalog.remove("a.test");
        assert!(!catalog.has_match("a.test"));
    }

    #[test]
    fn test_rebuild_skips_bad_rows() {
        let catalog = CertCatalog::new().unwrap();
        let mut bad = record("bad.test");
        bad.chain_pem = "garbage".to_string();
        catalog.rebuild(&[bad, record("good.test")]);

        assert!(!catalog.has_match("bad.test"));
        assert!(catalog.has_match("good.test"));
    }

    #[test]
    fn test_cert_expiry_parses() {
        let (chain, _) = self_signed("a.test");
        let expiry = cert_expiry_unix(&chain).unwrap();
        assert!(expiry > crate::db::now_unix());
    }
}

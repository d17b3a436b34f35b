//! ACME certificate acquisition and renewal
//!
//! The worker owns a job queue and processes one certificate request at a
//! time. HTTP-01 challenges are answered by the proxy's ACME filter out of
//! the shared token store; DNS-01 challenges shell out to certbot with the
//! provider plugin selected by the stored DNS provider record.
//!
//! # Security Considerations
//!
//! DNS provider credentials are materialized to a 0600 temp file only for
//! the duration of the certbot invocation and removed on every exit path.
//! Issued private keys are written with 0600 permissions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::db::{AuditEntry, CertRecord, Database};
use crate::snapshot::Publisher;
use crate::tls::{cert_expiry_unix, CertCatalog};

/// Tokens are abandoned if a challenge never completes
const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Upper bound for one certbot invocation
const CERTBOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Renewal window: certificates expiring within 30 days are renewed
pub const RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// Interval between renewal scans
const RENEWAL_SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Pending HTTP-01 challenges, shared with the proxy's ACME filter
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner
            .write()
            .await
            .insert(token, (key_authorization, Instant::now()));
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        let guard = self.inner.read().await;
        let (value, inserted) = guard.get(token)?;
        if inserted.elapsed() > TOKEN_TTL {
            return None;
        }
        Some(value.clone())
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }

    /// Drop tokens past their TTL
    pub async fn sweep(&self) {
        self.inner
            .write()
            .await
            .retain(|_, (_, inserted)| inserted.elapsed() <= TOKEN_TTL);
    }
}

/// A certificate acquisition job
#[derive(Debug, Clone)]
pub struct CertRequest {
    pub domain: String,
    pub email: String,
    pub dns_provider_id: Option<i64>,
}

impl CertRequest {
    /// Wildcard domains can only be validated over DNS-01
    pub fn validate(&self) -> Result<()> {
        if self.domain.starts_with("*.") && self.dns_provider_id.is_none() {
            bail!(
                "wildcard domain {} requires a DNS provider for DNS-01 validation",
                self.domain
            );
        }
        Ok(())
    }
}

/// Cloneable handle for enqueuing jobs and serving challenge tokens
#[derive(Clone)]
pub struct AcmeHandle {
    job_tx: mpsc::Sender<CertRequest>,
    challenges: Http01Challenges,
}

impl AcmeHandle {
    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    pub async fn enqueue(&self, request: CertRequest) -> Result<()> {
        request.validate()?;
        self.job_tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("ACME worker is not running"))
    }
}

pub struct AcmeWorker {
    db: Arc<Database>,
    catalog: Arc<CertCatalog>,
    publisher: Arc<Publisher>,
    challenges: Http01Challenges,
    job_rx: mpsc::Receiver<CertRequest>,
    certs_dir: PathBuf,
    directory_url: Option<String>,
}

impl AcmeWorker {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<CertCatalog>,
        publisher: Arc<Publisher>,
        certs_dir: PathBuf,
    ) -> (Self, AcmeHandle) {
        let (job_tx, job_rx) = mpsc::channel(64);
        let challenges = Http01Challenges::new();
        let handle = AcmeHandle {
            job_tx,
            challenges: challenges.clone(),
        };
        let worker = Self {
            db,
            catalog,
            publisher,
            challenges,
            job_rx,
            certs_dir,
            directory_url: std::env::var("ACME_DIRECTORY_URL").ok(),
        };
        (worker, handle)
    }

    /// Run until shutdown. Jobs are processed strictly serially; the
    /// renewal scan enqueues work through the same path.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut scan = tokio::time::interval(RENEWAL_SCAN_INTERVAL);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would rescan at startup
        scan.tick().await;

        loop {
            tokio::select! {
                job = self.job_rx.recv() => {
                    match job {
                        Some(request) => self.process(request).await,
                        None => break,
                    }
                }
                _ = scan.tick() => {
                    self.challenges.sweep().await;
                    self.renewal_scan().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("ACME worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Enumerate certificates near expiry and renew them, serially
    async fn renewal_scan(&mut self) {
        info!("Checking for expiring certificates");
        let threshold = crate::db::now_unix() + RENEWAL_WINDOW_SECS;
        let expiring = match self.db.expiring_certs(threshold) {
            Ok(certs) => certs,
            Err(e) => {
                error!(error = %e, "Failed to enumerate expiring certificates");
                return;
            }
        };

        for cert in expiring {
            info!(domain = %cert.domain, expires_at = cert.expires_at, "Renewing certificate");
            let email = std::env::var("ACME_EMAIL")
                .unwrap_or_else(|_| "admin@example.com".to_string());
            self.process(CertRequest {
                domain: cert.domain,
                email,
                dns_provider_id: cert.dns_provider_id,
            })
            .await;
        }
    }

    async fn process(&mut self, request: CertRequest) {
        if let Err(e) = request.validate() {
            self.audit_failure(&request, &e.to_string());
            return;
        }

        info!(domain = %request.domain, "Requesting certificate");
        let outcome = if request.dns_provider_id.is_some() {
            self.obtain_dns01(&request).await
        } else {
            self.obtain_http01(&request).await
        };

        match outcome {
            Ok((chain_pem, key_pem)) => {
                if let Err(e) = self.install(&request, &chain_pem, &key_pem).await {
                    error!(domain = %request.domain, error = %e, "Certificate install failed");
                    self.audit_failure(&request, &e.to_string());
                }
            }
            Err(e) => {
                error!(domain = %request.domain, error = %e, "Certificate acquisition failed");
                self.audit_failure(&request, &e.to_string());
            }
        }
    }

    /// Persist, publish, and announce a freshly issued certificate
    async fn install(&self, request: &CertRequest, chain_pem: &str, key_pem: &str) -> Result<()> {
        let expires_at = cert_expiry_unix(chain_pem)?;

        let cert_id = self.db.upsert_cert(
            &CertRecord {
                id: 0,
                domain: request.domain.clone(),
                chain_pem: chain_pem.to_string(),
                key_pem: key_pem.to_string(),
                expires_at,
                dns_provider_id: request.dns_provider_id,
            },
            &AuditEntry::new(
                "acme-worker",
                "issue",
                "certificate",
                &request.domain,
                format!("expires_at={}", expires_at),
                "",
            ),
        )?;

        write_cert_files(&self.certs_dir.join(cert_id.to_string()), chain_pem, key_pem)?;

        // Make the renewal selectable before the full reconcile lands
        self.catalog
            .install(&request.domain, chain_pem, key_pem)?;

        if let Err(e) = self.publisher.reconcile().await {
            warn!(error = %e, "Reconcile after certificate install failed");
        }

        info!(domain = %request.domain, expires_at, "Certificate installed");
        Ok(())
    }

    fn audit_failure(&self, request: &CertRequest, detail: &str) {
        let entry = AuditEntry::new(
            "acme-worker",
            "issue-failed",
            "certificate",
            &request.domain,
            detail,
            "",
        );
        if let Err(e) = self.db.append_audit(&entry) {
            error!(error = %e, "Failed to record ACME failure audit event");
        }
    }

    /// Load or create the ACME account
    async fn account(&self, email: &str) -> Result<Account> {
        let account_path = self.certs_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::builder()?.from_credentials(credentials).await?);
        }

        info!("Creating new ACME account");
        let directory_url = self
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url())
            .to_string();

        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url,
                None,
            )
            .await?;

        std::fs::create_dir_all(&self.certs_dir)?;
        std::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// HTTP-01 order flow; the proxy serves the token out of the shared store
    async fn obtain_http01(&self, request: &CertRequest) -> Result<(String, String)> {
        let account = self.account(&request.email).await?;
        let domain = request.domain.clone();

        let identifiers = vec![Identifier::Dns(domain.clone())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let pending_token = {
            let mut authorizations = order.authorizations();
            let mut pending_token: Option<String> = None;
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                if authz.status == AuthorizationStatus::Valid {
                    continue;
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", domain))?;

                let key_auth = challenge.key_authorization();
                debug!(domain = %domain, token = %challenge.token, "Publishing HTTP-01 token");
                self.challenges
                    .set(challenge.token.clone(), key_auth.as_str().to_string())
                    .await;

                challenge.set_ready().await?;
                pending_token = Some(challenge.token.clone());
            }
            pending_token
        };

        if let Some(token) = pending_token {
            // Poll until the authorization settles
            let mut attempts = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                order.refresh().await?;

                let status = {
                    let mut authorizations = order.authorizations();
                    let mut found = None;
                    while let Some(result) = authorizations.next().await {
                        let authz = result?;
                        if matches!(authz.identifier().identifier, Identifier::Dns(d) if *d == domain)
                        {
                            found = Some(authz.status);
                        }
                    }
                    found
                };

                match status {
                    Some(AuthorizationStatus::Valid) => break,
                    Some(AuthorizationStatus::Invalid) => {
                        self.challenges.remove(&token).await;
                        bail!("authorization failed for {}", domain);
                    }
                    _ => {
                        attempts += 1;
                        if attempts > 30 {
                            self.challenges.remove(&token).await;
                            bail!("authorization timeout for {}", domain);
                        }
                    }
                }
            }

            self.challenges.remove(&token).await;
        }

        // Wait for the order to become ready
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => bail!("order invalid for {}", domain),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        bail!("order timeout for {}", domain);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        // CSR and finalize
        let mut params = CertificateParams::new(vec![domain.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize_csr(csr.der()).await?;

        let mut attempts = 0;
        let chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    bail!("order valid but no certificate returned for {}", domain);
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        bail!("certificate timeout for {}", domain);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                status => bail!("unexpected order status: {:?}", status),
            }
        };

        Ok((chain_pem, private_key.serialize_pem()))
    }

    /// DNS-01 via the certbot utility with the provider's DNS plugin
    async fn obtain_dns01(&self, request: &CertRequest) -> Result<(String, String)> {
        let provider_id = request
            .dns_provider_id
            .ok_or_else(|| anyhow::anyhow!("DNS-01 requested without a provider"))?;
        let provider = self
            .db
            .get_dns_provider(provider_id)?
            .ok_or_else(|| anyhow::anyhow!("DNS provider {} not found", provider_id))?;

        let cred_path = credential_file_path(&request.domain);
        write_credential_file(&cred_path, &provider.credentials)?;

        let args = certbot_args(
            &request.domain,
            &request.email,
            &provider.provider_type,
            &cred_path,
        );

        info!(domain = %request.domain, provider = %provider.provider_type, "Invoking certbot");
        let result = tokio::time::timeout(
            CERTBOT_TIMEOUT,
            tokio::process::Command::new("certbot")
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        // The credential file never survives the invocation
        let _ = std::fs::remove_file(&cred_path);

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => bail!("failed to spawn certbot: {}", e),
            Err(_) => bail!(
                "certbot timed out after {}s for {}",
                CERTBOT_TIMEOUT.as_secs(),
                request.domain
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "certbot exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let live_dir = Path::new("/etc/letsencrypt/live").join(live_dir_name(&request.domain));
        let chain_pem = std::fs::read_to_string(live_dir.join("fullchain.pem"))
            .with_context(|| format!("reading {}", live_dir.join("fullchain.pem").display()))?;
        let key_pem = std::fs::read_to_string(live_dir.join("privkey.pem"))
            .with_context(|| format!("reading {}", live_dir.join("privkey.pem").display()))?;

        Ok((chain_pem, key_pem))
    }
}

/// certbot argument list for a DNS-01 issuance
fn certbot_args(domain: &str, email: &str, provider_type: &str, cred_path: &Path) -> Vec<String> {
    vec![
        "certonly".to_string(),
        "--non-interactive".to_string(),
        "--agree-tos".to_string(),
        "-m".to_string(),
        email.to_string(),
        format!("--dns-{}", provider_type),
        format!("--dns-{}-credentials", provider_type),
        cred_path.to_string_lossy().to_string(),
        "-d".to_string(),
        domain.to_string(),
    ]
}

/// certbot names the live directory after the domain minus any wildcard label
fn live_dir_name(domain: &str) -> String {
    domain.trim_start_matches("*.").to_string()
}

fn credential_file_path(domain: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "routegate-dns-{}-{}.ini",
        std::process::id(),
        domain.replace(['*', '.'], "_")
    ))
}

/// Write provider credentials with owner-only permissions
fn write_credential_file(path: &Path, credentials: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(credentials.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, credentials)?;
    }
    Ok(())
}

/// Mirror issued PEM material under `data/certs/<id>/`
fn write_cert_files(dir: &Path, chain_pem: &str, key_pem: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("fullchain.pem"), chain_pem)?;

    let key_path = dir.join("privkey.pem");
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_path)?;
        file.write_all(key_pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(&key_path, key_pem)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http01_challenge_store() {
        let challenges = Http01Challenges::new();

        challenges
            .set("token123".to_string(), "key_auth_123".to_string())
            .await;

        assert_eq!(
            challenges.get("token123").await,
            Some("key_auth_123".to_string())
        );
        assert_eq!(challenges.get("nonexistent").await, None);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[test]
    fn test_wildcard_requires_dns_provider() {
        let bad = CertRequest {
            domain: "*.apps.test".to_string(),
            email: "a@b.c".to_string(),
            dns_provider_id: None,
        };
        assert!(bad.validate().is_err());

        let good = CertRequest {
            domain: "*.apps.test".to_string(),
            email: "a@b.c".to_string(),
            dns_provider_id: Some(1),
        };
        assert!(good.validate().is_ok());

        let plain = CertRequest {
            domain: "apps.test".to_string(),
            email: "a@b.c".to_string(),
            dns_provider_id: None,
        };
        assert!(plain.validate().is_ok());
    }

    #[test]
    fn test_certbot_args_select_provider_plugin() {
        let args = certbot_args(
            "*.apps.test",
            "ops@test",
            "cloudflare",
            Path::new("/tmp/creds.ini"),
        );
        assert!(args.contains(&"--dns-cloudflare".to_string()));
        assert!(args.contains(&"--dns-cloudflare-credentials".to_string()));
        assert!(args.contains(&"/tmp/creds.ini".to_string()));
        assert!(args.contains(&"*.apps.test".to_string()));
        assert!(args.contains(&"--non-interactive".to_string()));
    }

    #[test]
    fn test_live_dir_strips_wildcard_label() {
        assert_eq!(live_dir_name("*.apps.test"), "apps.test");
        assert_eq!(live_dir_name("apps.test"), "apps.test");
    }

    #[cfg(unix)]
    #[test]
    fn test_credential_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let path = credential_file_path("perm.test");
        write_credential_file(&path, "dns_api_token = secret").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_file(&path).unwrap();
    }
}

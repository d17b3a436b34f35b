//! Immutable routing snapshot and its single-writer publisher
//!
//! The data plane reads one `Arc<Snapshot>` per request via an atomic
//! pointer load and keeps that reference for the request's lifetime.
//! The publisher rebuilds the snapshot from the store on every admin
//! mutation and installs it with a pointer swap; readers see either the
//! old or the new snapshot in its entirety.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::db::{ConfigView, Database};
use crate::tls::CertCatalog;

/// Scheme used when dialing an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => bail!("invalid upstream scheme: {}", other),
        }
    }
}

/// L4 forward protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Tcp,
    Udp,
}

impl StreamProtocol {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => bail!("invalid stream protocol: {}", other),
        }
    }
}

/// Allow/deny decision carried by an IP rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => bail!("invalid IP rule action: {}", other),
        }
    }
}

/// One IP rule: CIDR or literal address, evaluated top-to-bottom
#[derive(Debug, Clone, Serialize)]
pub struct IpRule {
    /// Original CIDR or literal text, kept for display and hashing
    pub raw: String,
    #[serde(skip)]
    pub net: IpNet,
    pub action: RuleAction,
}

impl IpRule {
    pub fn parse(raw: &str, action: RuleAction) -> Result<Self> {
        let net = parse_ip_or_cidr(raw)
            .with_context(|| format!("invalid IP rule address: {}", raw))?;
        Ok(Self {
            raw: raw.to_string(),
            net,
            action,
        })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.net.contains(&ip)
    }
}

/// Parse either a CIDR ("10.0.0.0/8") or a literal address ("10.1.2.3")
fn parse_ip_or_cidr(raw: &str) -> Result<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = raw.parse()?;
    Ok(IpNet::from(ip))
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessList {
    pub id: i64,
    pub name: String,
    /// Basic-Auth credentials: username -> stored verifier
    pub clients: BTreeMap<String, String>,
    pub ip_rules: Vec<IpRule>,
}

/// A header mutation applied before dispatch or before responding
#[derive(Debug, Clone, Serialize)]
pub struct HeaderRule {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationRoute {
    pub path: String,
    pub upstreams: Vec<String>,
    pub scheme: UpstreamScheme,
    pub upstream_sni: Option<String>,
    pub verify_ssl: bool,
    pub rewrite: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostRoute {
    pub id: i64,
    pub domain: String,
    pub upstreams: Vec<String>,
    pub scheme: UpstreamScheme,
    pub upstream_sni: Option<String>,
    pub verify_ssl: bool,
    pub ssl_forced: bool,
    pub redirect_to: Option<String>,
    pub redirect_status: u16,
    pub access_list_id: Option<i64>,
    /// Ordered by declaration (position)
    pub locations: Vec<LocationRoute>,
    pub request_headers: Vec<HeaderRule>,
    pub response_headers: Vec<HeaderRule>,
}

impl HostRoute {
    /// Longest-prefix location match; ties broken by declaration order.
    pub fn match_location(&self, path: &str) -> Option<&LocationRoute> {
        let mut best: Option<&LocationRoute> = None;
        let mut best_len = 0;
        for loc in &self.locations {
            if path.starts_with(&loc.path) && loc.path.len() > best_len {
                best = Some(loc);
                best_len = loc.path.len();
            }
        }
        best
    }
}

/// Strip a matched prefix from the path, keeping the result rooted.
pub fn rewritten_path(prefix: &str, path: &str) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.is_empty() {
        return "/".to_string();
    }
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey {
    pub protocol: StreamProtocol,
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamRoute {
    pub listen_port: u16,
    pub protocol: StreamProtocol,
    pub forward_host: String,
    pub forward_port: u16,
}

impl StreamRoute {
    pub fn key(&self) -> StreamKey {
        StreamKey {
            protocol: self.protocol,
            listen_port: self.listen_port,
        }
    }

    pub fn forward_addr(&self) -> String {
        format!("{}:{}", self.forward_host, self.forward_port)
    }
}

/// Operator-tunable settings carried by the snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct Settings {
    /// Custom error page template (%%STATUS%% placeholder)
    pub error_page: String,
}

/// The immutable configuration value read by the data plane.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub version: u64,
    /// Case-folded domain -> host route (exact match only at this layer)
    pub hosts: BTreeMap<String, HostRoute>,
    /// Listen port -> stream forward
    pub streams: BTreeMap<u16, StreamRoute>,
    pub access_lists: BTreeMap<i64, AccessList>,
    pub settings: Settings,
    #[serde(skip)]
    pub content_hash: String,
}

impl Snapshot {
    pub fn empty() -> Self {
        let mut snapshot = Self {
            version: 0,
            hosts: BTreeMap::new(),
            streams: BTreeMap::new(),
            access_lists: BTreeMap::new(),
            settings: Settings::default(),
            content_hash: String::new(),
        };
        snapshot.content_hash = snapshot.compute_hash();
        snapshot
    }

    pub fn find_host(&self, domain: &str) -> Option<&HostRoute> {
        self.hosts.get(domain)
    }

    pub fn access_list(&self, id: i64) -> Option<&AccessList> {
        self.access_lists.get(&id)
    }

    /// Content hash over the canonical serialization; identical store
    /// contents produce identical hashes.
    fn compute_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

/// Build a snapshot from a consistent store view. Fails without side
/// effects on malformed rows or dangling references.
pub fn build_snapshot(view: &ConfigView, version: u64) -> Result<Snapshot> {
    let mut access_lists = BTreeMap::new();
    for list in &view.access_lists {
        access_lists.insert(
            list.id,
            AccessList {
                id: list.id,
                name: list.name.clone(),
                clients: BTreeMap::new(),
                ip_rules: Vec::new(),
            },
        );
    }
    for client in &view.clients {
        if let Some(list) = access_lists.get_mut(&client.list_id) {
            list.clients
                .insert(client.username.clone(), client.password_hash.clone());
        }
    }
    for rule in &view.ip_rules {
        if let Some(list) = access_lists.get_mut(&rule.list_id) {
            let action = RuleAction::parse(&rule.action)?;
            list.ip_rules.push(IpRule::parse(&rule.ip, action)?);
        }
    }

    // Group locations and header rules by host id
    let mut locations_by_host: BTreeMap<i64, Vec<LocationRoute>> = BTreeMap::new();
    for loc in &view.locations {
        locations_by_host
            .entry(loc.host_id)
            .or_default()
            .push(LocationRoute {
                path: loc.path.clone(),
                upstreams: loc.targets.clone(),
                scheme: UpstreamScheme::parse(&loc.scheme)?,
                upstream_sni: loc.upstream_sni.clone(),
                verify_ssl: loc.verify_ssl,
                rewrite: loc.rewrite,
            });
    }

    let mut request_headers: BTreeMap<i64, Vec<HeaderRule>> = BTreeMap::new();
    let mut response_headers: BTreeMap<i64, Vec<HeaderRule>> = BTreeMap::new();
    for header in &view.headers {
        let rule = HeaderRule {
            name: header.name.clone(),
            value: header.value.clone(),
        };
        match header.direction.as_str() {
            "request" => request_headers.entry(header.host_id).or_default().push(rule),
            "response" => response_headers.entry(header.host_id).or_default().push(rule),
            other => bail!("invalid header direction: {}", other),
        }
    }

    let mut hosts = BTreeMap::new();
    let mut seen = HashSet::new();
    for host in &view.hosts {
        let domain = host.domain.to_lowercase();
        if !seen.insert(domain.clone()) {
            bail!("duplicate host domain after case folding: {}", domain);
        }
        if let Some(list_id) = host.access_list_id {
            if !access_lists.contains_key(&list_id) {
                bail!(
                    "host {} references missing access list {}",
                    domain,
                    list_id
                );
            }
        }

        hosts.insert(
            domain.clone(),
            HostRoute {
                id: host.id,
                domain,
                upstreams: host.targets.clone(),
                scheme: UpstreamScheme::parse(&host.scheme)?,
                upstream_sni: host.upstream_sni.clone(),
                verify_ssl: host.verify_ssl,
                ssl_forced: host.ssl_forced,
                redirect_to: host.redirect_to.clone(),
                redirect_status: host.redirect_status,
                access_list_id: host.access_list_id,
                locations: locations_by_host.remove(&host.id).unwrap_or_default(),
                request_headers: request_headers.remove(&host.id).unwrap_or_default(),
                response_headers: response_headers.remove(&host.id).unwrap_or_default(),
            },
        );
    }

    let mut streams = BTreeMap::new();
    for stream in &view.streams {
        streams.insert(
            stream.listen_port,
            StreamRoute {
                listen_port: stream.listen_port,
                protocol: StreamProtocol::parse(&stream.protocol)?,
                forward_host: stream.forward_host.clone(),
                forward_port: stream.forward_port,
            },
        );
    }

    let mut snapshot = Snapshot {
        version,
        hosts,
        streams,
        access_lists,
        settings: Settings {
            error_page: view.error_page.clone(),
        },
        content_hash: String::new(),
    };
    snapshot.content_hash = snapshot.compute_hash();
    Ok(snapshot)
}

/// Single-writer reconciler. Concurrent callers coalesce: whoever is
/// queued first behind a running reconcile performs one rebuild that
/// covers every request that arrived in the meantime.
pub struct Publisher {
    db: Arc<Database>,
    current: Arc<ArcSwap<Snapshot>>,
    catalog: Arc<CertCatalog>,
    publish_tx: watch::Sender<Arc<Snapshot>>,
    lock: Mutex<()>,
    pending: AtomicBool,
    version: AtomicU64,
}

impl Publisher {
    pub fn new(db: Arc<Database>, catalog: Arc<CertCatalog>) -> Self {
        let empty = Arc::new(Snapshot::empty());
        let (publish_tx, _) = watch::channel(Arc::clone(&empty));
        Self {
            db,
            current: Arc::new(ArcSwap::new(empty)),
            catalog,
            publish_tx,
            lock: Mutex::new(()),
            pending: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }

    /// The snapshot the data plane reads; load once per request.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Handle for components that read the pointer themselves.
    pub fn shared(&self) -> Arc<ArcSwap<Snapshot>> {
        Arc::clone(&self.current)
    }

    /// Subscribe to snapshot publications (stream forwarder reconciliation).
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.publish_tx.subscribe()
    }

    /// Rebuild the snapshot from the store and install it atomically.
    ///
    /// On build failure the previous snapshot stays installed and the
    /// error propagates to the caller (and its audit trail).
    pub async fn reconcile(&self) -> Result<Arc<Snapshot>> {
        self.pending.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock().await;
        if !self.pending.swap(false, Ordering::SeqCst) {
            // A rebuild that started after this request was already made
            return Ok(self.current());
        }

        let db = Arc::clone(&self.db);
        let view = tokio::task::spawn_blocking(move || db.config_view())
            .await
            .context("snapshot read task failed")??;

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = match build_snapshot(&view, version) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                error!(error = %e, "Snapshot build failed; previous snapshot retained");
                return Err(e);
            }
        };

        self.current.store(Arc::clone(&snapshot));

        // Refresh the certificate catalog from the same view
        self.catalog.rebuild(&view.certs);

        // Hand the new snapshot to the stream forwarder
        let _ = self.publish_tx.send(Arc::clone(&snapshot));

        info!(
            version,
            hosts = snapshot.hosts.len(),
            streams = snapshot.streams.len(),
            "Configuration snapshot published"
        );
        Ok(snapshot)
    }
}

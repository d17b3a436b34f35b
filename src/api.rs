//! Admin HTTP API and static UI server
//!
//! The sole mutation path for the control plane: every write persists to
//! the store together with its audit event, then triggers a publisher
//! reconcile before the response is returned, so a successful reply
//! means the change is live for the next accepted connection.

use crate::access_log::AccessLog;
use crate::acme::{AcmeHandle, CertRequest};
use crate::auth::{hash_password, verify_password, AuthManager};
use crate::db::{
    AuditEntry, CertRecord, ClientRecord, Database, DnsProviderRecord, HeaderRecord, HostRecord,
    IpRuleRecord, LocationRecord, StreamRecord, UserRecord,
};
use crate::snapshot::Publisher;
use crate::stats::StatsCollector;
use crate::tls::cert_expiry_unix;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the admin surface
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response<T: Serialize>(status: StatusCode, payload: &ApiResponse<T>) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &ApiResponse::ok(data))
}

fn error_json(status: StatusCode, msg: impl Into<String>) -> Response<Full<Bytes>> {
    json_response::<()>(status, &ApiResponse::error(msg))
}

// ==================== Request payloads ====================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

/// Host upsert; `targets` as a list, or `target` as a CSV string from
/// older clients (the adapter splits it)
#[derive(Debug, Deserialize)]
struct HostPayload {
    domain: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default = "default_scheme")]
    scheme: String,
    #[serde(default)]
    upstream_sni: Option<String>,
    #[serde(default = "default_true")]
    verify_ssl: bool,
    #[serde(default)]
    ssl_forced: bool,
    #[serde(default)]
    redirect_to: Option<String>,
    #[serde(default = "default_redirect_status")]
    redirect_status: u16,
    #[serde(default)]
    access_list_id: Option<i64>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

fn default_redirect_status() -> u16 {
    301
}

impl HostPayload {
    fn resolved_targets(&self) -> Vec<String> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }
        self.target
            .as_deref()
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct LocationPayload {
    path: String,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default = "default_scheme")]
    scheme: String,
    #[serde(default)]
    upstream_sni: Option<String>,
    #[serde(default = "default_true")]
    verify_ssl: bool,
    #[serde(default)]
    rewrite: bool,
}

#[derive(Debug, Deserialize)]
struct HeaderPayload {
    name: String,
    value: String,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct ClientPayload {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct IpRulePayload {
    ip: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct AccessListPayload {
    name: String,
}

/// Certificate creation: either an upload (PEM material inline) or an
/// ACME request (no PEM material; optional DNS provider for DNS-01)
#[derive(Debug, Deserialize)]
struct CertPayload {
    domain: String,
    #[serde(default)]
    chain_pem: Option<String>,
    #[serde(default)]
    key_pem: Option<String>,
    #[serde(default)]
    dns_provider_id: Option<i64>,
    #[serde(default)]
    email: Option<String>,
}

/// Certificate listing entry; key material never leaves the store
#[derive(Debug, Serialize)]
struct CertSummary {
    id: i64,
    domain: String,
    expires_at: i64,
    dns_provider_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DnsProviderPayload {
    name: String,
    provider_type: String,
    credentials: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "viewer".to_string()
}

#[derive(Debug, Deserialize)]
struct RoleUpdatePayload {
    role: String,
}

#[derive(Debug, Deserialize)]
struct PasswordUpdatePayload {
    password: String,
}

#[derive(Debug, Deserialize)]
struct ErrorPagePayload {
    html: String,
}

/// Host listing entry with its children attached
#[derive(Debug, Serialize)]
struct HostView {
    #[serde(flatten)]
    host: HostRecord,
    locations: Vec<LocationRecord>,
    headers: Vec<HeaderRecord>,
}

/// Authenticated actor attached to a request
#[derive(Debug, Clone)]
struct Actor {
    username: String,
    role: String,
}

impl Actor {
    fn can_write(&self) -> bool {
        self.role == "admin" || self.role == "operator"
    }

    fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Admin API server
pub struct AdminApi {
    bind_addr: SocketAddr,
    db: Arc<Database>,
    publisher: Arc<Publisher>,
    stats: Arc<StatsCollector>,
    access_log: Arc<AccessLog>,
    acme: AcmeHandle,
    auth: AuthManager,
    static_dir: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: SocketAddr,
        db: Arc<Database>,
        publisher: Arc<Publisher>,
        stats: Arc<StatsCollector>,
        access_log: Arc<AccessLog>,
        acme: AcmeHandle,
        auth: AuthManager,
        static_dir: PathBuf,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            db,
            publisher,
            stats,
            access_log,
            acme,
            auth,
            static_dir,
            shutdown_rx,
        }
    }

    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %self.bind_addr, "Admin API listening");

        let this = Arc::new(self);
        let mut shutdown_rx = this.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&this);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let api = Arc::clone(&api);
                                    async move { Ok::<_, hyper::Error>(api.handle(req, addr).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Admin accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string).unwrap_or_default();

        debug!(method = %method, path = %path, "Admin request");

        // Unauthenticated surface
        if method == Method::GET && path == "/health" {
            return ok_json(serde_json::json!({ "name": PKG_NAME, "version": VERSION }));
        }
        if method == Method::GET && path == "/metrics" {
            return Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(self.stats.export_prometheus())))
                .expect("valid response builder");
        }
        if method == Method::POST && path == "/api/login" {
            return self.login(req).await;
        }
        if method == Method::GET && !path.starts_with("/api/") {
            return self.serve_static(&path).await;
        }

        // Everything else requires a bearer token
        let actor = match self.authenticate(&req) {
            Some(actor) => actor,
            None => return error_json(StatusCode::UNAUTHORIZED, "invalid or missing token"),
        };

        let ip = peer.ip().to_string();
        let result = self
            .dispatch(req, &method, &path, &query, &actor, &ip)
            .await;

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %method, path = %path, error = %e, "Admin request failed");
                error_json(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }

    fn authenticate(&self, req: &Request<Incoming>) -> Option<Actor> {
        let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let token = header.strip_prefix("Bearer ")?;
        let data = self.auth.verify_token(token).ok()?;
        Some(Actor {
            username: data.claims.sub,
            role: data.claims.role,
        })
    }

    async fn login(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let payload: LoginRequest = match read_json(req).await {
            Ok(p) => p,
            Err(e) => return error_json(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let user = match self.db.get_user(&payload.username) {
            Ok(Some(user)) => user,
            Ok(None) => return error_json(StatusCode::UNAUTHORIZED, "wrong credentials"),
            Err(e) => {
                error!(error = %e, "Login lookup failed");
                return error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };

        if !verify_password(&payload.password, &user.password_hash) {
            return error_json(StatusCode::UNAUTHORIZED, "wrong credentials");
        }

        match self.auth.create_token(&user.username, &user.role) {
            Ok(token) => ok_json(LoginResponse { token }),
            Err(e) => {
                error!(error = %e, "Token creation failed");
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        method: &Method,
        path: &str,
        query: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        // Reads first
        match (method, path) {
            (&Method::GET, "/api/hosts") => return self.list_hosts(),
            (&Method::GET, "/api/streams") => return Ok(ok_json(self.db.list_streams()?)),
            (&Method::GET, "/api/access-lists") => return self.list_access_lists(),
            (&Method::GET, "/api/certs") => {
                let certs: Vec<CertSummary> = self
                    .db
                    .list_certs()?
                    .into_iter()
                    .map(|c| CertSummary {
                        id: c.id,
                        domain: c.domain,
                        expires_at: c.expires_at,
                        dns_provider_id: c.dns_provider_id,
                    })
                    .collect();
                return Ok(ok_json(certs));
            }
            (&Method::GET, "/api/dns-providers") => {
                return Ok(ok_json(self.db.list_dns_providers()?))
            }
            (&Method::GET, "/api/users") => {
                if !actor.is_admin() {
                    return Ok(error_json(StatusCode::FORBIDDEN, "admin role required"));
                }
                return Ok(ok_json(self.db.list_users()?));
            }
            (&Method::GET, "/api/users/me") => {
                return Ok(match self.db.get_user(&actor.username)? {
                    Some(user) => ok_json(user),
                    None => error_json(StatusCode::NOT_FOUND, "user not found"),
                });
            }
            (&Method::GET, "/api/audit-logs") => return self.list_audit(query),
            (&Method::GET, "/api/stats/realtime") => return Ok(ok_json(self.stats.realtime())),
            (&Method::GET, "/api/stats/history") => {
                let params = parse_query(query);
                let hours = params
                    .get("hours")
                    .and_then(|h| h.parse::<u32>().ok())
                    .unwrap_or(24);
                return Ok(ok_json(self.stats.history(hours)));
            }
            (&Method::GET, "/api/logs") => {
                let params = parse_query(query);
                let lines = params
                    .get("lines")
                    .and_then(|l| l.parse::<usize>().ok())
                    .unwrap_or(100);
                return Ok(ok_json(self.access_log.tail(lines)));
            }
            (&Method::GET, "/api/settings/error-page") => {
                let html = self.db.get_setting("error_page_html")?.unwrap_or_default();
                return Ok(ok_json(serde_json::json!({ "html": html })));
            }
            _ => {}
        }

        // Any authenticated user may rotate their own password
        if method == Method::PUT && path == "/api/users/me/password" {
            return self.update_own_password(req, actor, ip).await;
        }

        // Everything else that mutates requires an operator-capable role
        if !actor.can_write() {
            return Ok(error_json(StatusCode::FORBIDDEN, "write access required"));
        }

        let response = match (method, path) {
            (&Method::POST, "/api/hosts") => self.upsert_host(req, None, actor, ip).await?,
            (&Method::PUT, p) if p.starts_with("/api/hosts/") && p.matches('/').count() == 3 => {
                let domain = p.strip_prefix("/api/hosts/").unwrap().to_string();
                self.upsert_host(req, Some(domain), actor, ip).await?
            }
            (&Method::DELETE, p) if p.starts_with("/api/hosts/") && p.matches('/').count() == 3 => {
                let domain = p.strip_prefix("/api/hosts/").unwrap();
                self.delete_host(domain, actor, ip).await?
            }
            (&Method::POST, p) if p.starts_with("/api/hosts/") && p.ends_with("/locations") => {
                let domain = host_from_subpath(p, "/locations")?;
                self.upsert_location(req, &domain, actor, ip).await?
            }
            (&Method::DELETE, p) if p.starts_with("/api/hosts/") && p.ends_with("/locations") => {
                let domain = host_from_subpath(p, "/locations")?;
                self.delete_location(&domain, query, actor, ip).await?
            }
            (&Method::POST, p) if p.starts_with("/api/hosts/") && p.ends_with("/headers") => {
                let domain = host_from_subpath(p, "/headers")?;
                self.add_header(req, &domain, actor, ip).await?
            }
            (&Method::DELETE, p) if p.starts_with("/api/hosts/") && p.contains("/headers/") => {
                let id = p
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| anyhow::anyhow!("invalid header id"))?;
                self.delete_header(id, actor, ip).await?
            }
            (&Method::POST, "/api/streams") => self.upsert_stream(req, actor, ip).await?,
            (&Method::DELETE, p) if p.starts_with("/api/streams/") => {
                let port = p
                    .strip_prefix("/api/streams/")
                    .and_then(|s| s.parse::<u16>().ok())
                    .ok_or_else(|| anyhow::anyhow!("invalid listen port"))?;
                self.delete_stream(port, actor, ip).await?
            }
            (&Method::POST, "/api/access-lists") => self.create_access_list(req, actor, ip).await?,
            (&Method::DELETE, p)
                if p.starts_with("/api/access-lists/") && p.matches('/').count() == 3 =>
            {
                let id = access_list_id(p)?;
                self.delete_access_list(id, actor, ip).await?
            }
            (&Method::POST, p)
                if p.starts_with("/api/access-lists/") && p.ends_with("/clients") =>
            {
                let id = access_list_id(p)?;
                self.upsert_client(req, id, actor, ip).await?
            }
            (&Method::DELETE, p)
                if p.starts_with("/api/access-lists/") && p.contains("/clients/") =>
            {
                let id = access_list_id(p)?;
                let username = p
                    .rsplit('/')
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing username"))?;
                self.delete_client(id, username, actor, ip).await?
            }
            (&Method::POST, p) if p.starts_with("/api/access-lists/") && p.ends_with("/ips") => {
                let id = access_list_id(p)?;
                self.add_ip_rule(req, id, actor, ip).await?
            }
            (&Method::DELETE, p)
                if p.starts_with("/api/access-lists/") && p.contains("/ips/") =>
            {
                let id = access_list_id(p)?;
                let rule_ip = p
                    .splitn(6, '/')
                    .nth(5)
                    .ok_or_else(|| anyhow::anyhow!("missing ip"))?;
                self.delete_ip_rule(id, rule_ip, actor, ip).await?
            }
            (&Method::POST, "/api/certs") => self.create_cert(req, actor, ip).await?,
            (&Method::DELETE, p) if p.starts_with("/api/certs/") => {
                let id = p
                    .strip_prefix("/api/certs/")
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| anyhow::anyhow!("invalid certificate id"))?;
                self.delete_cert(id, actor, ip).await?
            }
            (&Method::POST, "/api/dns-providers") => {
                self.create_dns_provider(req, actor, ip).await?
            }
            (&Method::DELETE, p) if p.starts_with("/api/dns-providers/") => {
                let id = p
                    .strip_prefix("/api/dns-providers/")
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| anyhow::anyhow!("invalid provider id"))?;
                self.delete_dns_provider(id, actor, ip).await?
            }
            (&Method::POST, "/api/users") => self.create_user(req, actor, ip).await?,
            (&Method::PUT, p) if p.starts_with("/api/users/") => {
                let id = user_id(p)?;
                self.update_user_role(req, id, actor, ip).await?
            }
            (&Method::DELETE, p) if p.starts_with("/api/users/") => {
                let id = user_id(p)?;
                self.delete_user(id, actor, ip).await?
            }
            (&Method::POST, "/api/settings/error-page") => {
                self.set_error_page(req, actor, ip).await?
            }
            _ => error_json(StatusCode::NOT_FOUND, "no such endpoint"),
        };

        Ok(response)
    }

    // ==================== Hosts ====================

    fn list_hosts(&self) -> anyhow::Result<Response<Full<Bytes>>> {
        let hosts = self.db.list_hosts()?;
        let locations = self.db.list_locations()?;
        let headers = self.db.list_headers()?;

        let mut locations_by_host: HashMap<i64, Vec<LocationRecord>> = HashMap::new();
        for loc in locations {
            locations_by_host.entry(loc.host_id).or_default().push(loc);
        }
        let mut headers_by_host: HashMap<i64, Vec<HeaderRecord>> = HashMap::new();
        for header in headers {
            headers_by_host.entry(header.host_id).or_default().push(header);
        }

        let views: Vec<HostView> = hosts
            .into_iter()
            .map(|host| HostView {
                locations: locations_by_host.remove(&host.id).unwrap_or_default(),
                headers: headers_by_host.remove(&host.id).unwrap_or_default(),
                host,
            })
            .collect();

        Ok(ok_json(views))
    }

    async fn upsert_host(
        &self,
        req: Request<Incoming>,
        domain_from_path: Option<String>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: HostPayload = read_json(req).await?;
        let domain = domain_from_path
            .or(payload.domain.clone())
            .ok_or_else(|| anyhow::anyhow!("domain is required"))?
            .to_lowercase();

        if domain.is_empty() {
            anyhow::bail!("domain must not be empty");
        }
        if payload.scheme != "http" && payload.scheme != "https" {
            anyhow::bail!("scheme must be http or https");
        }
        if payload.redirect_status != 301 && payload.redirect_status != 302 {
            anyhow::bail!("redirect_status must be 301 or 302");
        }
        if let Some(list_id) = payload.access_list_id {
            if !self.db.access_list_exists(list_id)? {
                anyhow::bail!("access list {} does not exist", list_id);
            }
        }

        let record = HostRecord {
            id: 0,
            domain: domain.clone(),
            targets: payload.resolved_targets(),
            scheme: payload.scheme.clone(),
            upstream_sni: payload.upstream_sni.clone(),
            verify_ssl: payload.verify_ssl,
            ssl_forced: payload.ssl_forced,
            redirect_to: payload.redirect_to.clone(),
            redirect_status: payload.redirect_status,
            access_list_id: payload.access_list_id,
        };

        self.db.upsert_host(
            &record,
            &AuditEntry::new(&actor.username, "upsert", "host", &domain, "", ip),
        )?;
        self.reconcile().await?;

        Ok(ok_json(record))
    }

    async fn delete_host(
        &self,
        domain: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_host(
            domain,
            &AuditEntry::new(&actor.username, "delete", "host", domain, "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "host not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": domain })))
    }

    async fn upsert_location(
        &self,
        req: Request<Incoming>,
        domain: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: LocationPayload = read_json(req).await?;
        let host = self
            .db
            .get_host(domain)?
            .ok_or_else(|| anyhow::anyhow!("host {} not found", domain))?;

        if !payload.path.starts_with('/') {
            anyhow::bail!("location path must start with /");
        }
        if payload.scheme != "http" && payload.scheme != "https" {
            anyhow::bail!("scheme must be http or https");
        }

        let targets = if !payload.targets.is_empty() {
            payload.targets.clone()
        } else {
            payload
                .target
                .as_deref()
                .map(|csv| {
                    csv.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        let record = LocationRecord {
            id: 0,
            host_id: host.id,
            path: payload.path.clone(),
            targets,
            scheme: payload.scheme.clone(),
            upstream_sni: payload.upstream_sni.clone(),
            verify_ssl: payload.verify_ssl,
            rewrite: payload.rewrite,
            position: 0,
        };

        self.db.upsert_location(
            &record,
            &AuditEntry::new(
                &actor.username,
                "upsert",
                "location",
                format!("{}{}", domain, payload.path),
                "",
                ip,
            ),
        )?;
        self.reconcile().await?;

        Ok(ok_json(record))
    }

    async fn delete_location(
        &self,
        domain: &str,
        query: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let params = parse_query(query);
        let path = params
            .get("path")
            .ok_or_else(|| anyhow::anyhow!("path query parameter is required"))?;
        let host = self
            .db
            .get_host(domain)?
            .ok_or_else(|| anyhow::anyhow!("host {} not found", domain))?;

        let deleted = self.db.delete_location(
            host.id,
            path,
            &AuditEntry::new(
                &actor.username,
                "delete",
                "location",
                format!("{}{}", domain, path),
                "",
                ip,
            ),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "location not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": path })))
    }

    async fn add_header(
        &self,
        req: Request<Incoming>,
        domain: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: HeaderPayload = read_json(req).await?;
        if payload.direction != "request" && payload.direction != "response" {
            anyhow::bail!("direction must be request or response");
        }
        let host = self
            .db
            .get_host(domain)?
            .ok_or_else(|| anyhow::anyhow!("host {} not found", domain))?;

        let mut record = HeaderRecord {
            id: 0,
            host_id: host.id,
            name: payload.name.clone(),
            value: payload.value.clone(),
            direction: payload.direction.clone(),
        };
        record.id = self.db.add_header(
            &record,
            &AuditEntry::new(&actor.username, "create", "header", &payload.name, "", ip),
        )?;
        self.reconcile().await?;

        Ok(ok_json(record))
    }

    async fn delete_header(
        &self,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_header(
            id,
            &AuditEntry::new(&actor.username, "delete", "header", id.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "header not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": id })))
    }

    // ==================== Streams ====================

    async fn upsert_stream(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: StreamRecord = read_json(req).await?;
        if payload.protocol != "tcp" && payload.protocol != "udp" {
            anyhow::bail!("protocol must be tcp or udp");
        }
        if payload.listen_port == 0 {
            anyhow::bail!("listen_port must be non-zero");
        }

        self.db.upsert_stream(
            &payload,
            &AuditEntry::new(
                &actor.username,
                "upsert",
                "stream",
                payload.listen_port.to_string(),
                format!("{} -> {}:{}", payload.protocol, payload.forward_host, payload.forward_port),
                ip,
            ),
        )?;
        self.reconcile().await?;

        Ok(ok_json(payload))
    }

    async fn delete_stream(
        &self,
        port: u16,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_stream(
            port,
            &AuditEntry::new(&actor.username, "delete", "stream", port.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "stream not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": port })))
    }

    // ==================== Access lists ====================

    fn list_access_lists(&self) -> anyhow::Result<Response<Full<Bytes>>> {
        #[derive(Serialize)]
        struct AccessListView {
            id: i64,
            name: String,
            clients: Vec<String>,
            ips: Vec<IpRuleRecord>,
        }

        let lists = self.db.list_access_lists()?;
        let clients = self.db.list_clients()?;
        let rules = self.db.list_ip_rules()?;

        let views: Vec<AccessListView> = lists
            .into_iter()
            .map(|list| AccessListView {
                id: list.id,
                name: list.name,
                clients: clients
                    .iter()
                    .filter(|c| c.list_id == list.id)
                    .map(|c| c.username.clone())
                    .collect(),
                ips: rules.iter().filter(|r| r.list_id == list.id).cloned().collect(),
            })
            .collect();

        Ok(ok_json(views))
    }

    async fn create_access_list(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: AccessListPayload = read_json(req).await?;
        let id = self.db.create_access_list(
            &payload.name,
            &AuditEntry::new(&actor.username, "create", "access-list", &payload.name, "", ip),
        )?;
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "id": id, "name": payload.name })))
    }

    async fn delete_access_list(
        &self,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_access_list(
            id,
            &AuditEntry::new(&actor.username, "delete", "access-list", id.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "access list not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": id })))
    }

    async fn upsert_client(
        &self,
        req: Request<Incoming>,
        list_id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: ClientPayload = read_json(req).await?;
        if !self.db.access_list_exists(list_id)? {
            anyhow::bail!("access list {} does not exist", list_id);
        }

        self.db.upsert_client(
            &ClientRecord {
                list_id,
                username: payload.username.clone(),
                password_hash: hash_password(&payload.password),
            },
            &AuditEntry::new(
                &actor.username,
                "upsert",
                "access-list-client",
                &payload.username,
                "",
                ip,
            ),
        )?;
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "username": payload.username })))
    }

    async fn delete_client(
        &self,
        list_id: i64,
        username: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_client(
            list_id,
            username,
            &AuditEntry::new(&actor.username, "delete", "access-list-client", username, "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "client not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": username })))
    }

    async fn add_ip_rule(
        &self,
        req: Request<Incoming>,
        list_id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: IpRulePayload = read_json(req).await?;
        if payload.action != "allow" && payload.action != "deny" {
            anyhow::bail!("action must be allow or deny");
        }
        // Reject rules the snapshot builder would choke on
        crate::snapshot::IpRule::parse(
            &payload.ip,
            crate::snapshot::RuleAction::parse(&payload.action)?,
        )?;
        if !self.db.access_list_exists(list_id)? {
            anyhow::bail!("access list {} does not exist", list_id);
        }

        let id = self.db.add_ip_rule(
            &IpRuleRecord {
                id: 0,
                list_id,
                ip: payload.ip.clone(),
                action: payload.action.clone(),
                position: 0,
            },
            &AuditEntry::new(&actor.username, "create", "access-list-ip", &payload.ip, "", ip),
        )?;
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "id": id, "ip": payload.ip })))
    }

    async fn delete_ip_rule(
        &self,
        list_id: i64,
        rule_ip: &str,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_ip_rule(
            list_id,
            rule_ip,
            &AuditEntry::new(&actor.username, "delete", "access-list-ip", rule_ip, "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "ip rule not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": rule_ip })))
    }

    // ==================== Certificates ====================

    async fn create_cert(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: CertPayload = read_json(req).await?;
        let domain = payload.domain.to_lowercase();

        if domain.starts_with('*') && !domain.starts_with("*.") {
            anyhow::bail!("wildcard domains must begin with *.");
        }

        match (&payload.chain_pem, &payload.key_pem) {
            // Upload path: PEM material provided inline
            (Some(chain_pem), Some(key_pem)) => {
                // Parse before persisting so a bad upload never enters the store
                crate::tls::load_certified_key(chain_pem, key_pem)?;
                let expires_at = cert_expiry_unix(chain_pem)?;

                let id = self.db.upsert_cert(
                    &CertRecord {
                        id: 0,
                        domain: domain.clone(),
                        chain_pem: chain_pem.clone(),
                        key_pem: key_pem.clone(),
                        expires_at,
                        dns_provider_id: payload.dns_provider_id,
                    },
                    &AuditEntry::new(&actor.username, "upload", "certificate", &domain, "", ip),
                )?;
                self.reconcile().await?;
                Ok(ok_json(serde_json::json!({ "id": id, "domain": domain, "expires_at": expires_at })))
            }
            (None, None) => {
                // Request path: hand the job to the ACME worker
                if let Some(provider_id) = payload.dns_provider_id {
                    if self.db.get_dns_provider(provider_id)?.is_none() {
                        anyhow::bail!("DNS provider {} does not exist", provider_id);
                    }
                }
                let email = payload
                    .email
                    .clone()
                    .or_else(|| std::env::var("ACME_EMAIL").ok())
                    .unwrap_or_else(|| "admin@example.com".to_string());

                self.acme
                    .enqueue(CertRequest {
                        domain: domain.clone(),
                        email,
                        dns_provider_id: payload.dns_provider_id,
                    })
                    .await?;

                self.db.append_audit(&AuditEntry::new(
                    &actor.username,
                    "request",
                    "certificate",
                    &domain,
                    "",
                    ip,
                ))?;
                Ok(ok_json(serde_json::json!({ "domain": domain, "status": "requested" })))
            }
            _ => anyhow::bail!("provide both chain_pem and key_pem, or neither"),
        }
    }

    async fn delete_cert(
        &self,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_cert(
            id,
            &AuditEntry::new(&actor.username, "delete", "certificate", id.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "certificate not found"));
        }
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "deleted": id })))
    }

    // ==================== DNS providers ====================

    async fn create_dns_provider(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: DnsProviderPayload = read_json(req).await?;
        let id = self.db.create_dns_provider(
            &DnsProviderRecord {
                id: 0,
                name: payload.name.clone(),
                provider_type: payload.provider_type.clone(),
                credentials: payload.credentials.clone(),
            },
            &AuditEntry::new(&actor.username, "create", "dns-provider", &payload.name, "", ip),
        )?;
        Ok(ok_json(serde_json::json!({ "id": id, "name": payload.name })))
    }

    async fn delete_dns_provider(
        &self,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let deleted = self.db.delete_dns_provider(
            id,
            &AuditEntry::new(&actor.username, "delete", "dns-provider", id.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "dns provider not found"));
        }
        Ok(ok_json(serde_json::json!({ "deleted": id })))
    }

    // ==================== Users ====================

    async fn create_user(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        if !actor.is_admin() {
            return Ok(error_json(StatusCode::FORBIDDEN, "admin role required"));
        }
        let payload: UserPayload = read_json(req).await?;
        if !["admin", "operator", "viewer"].contains(&payload.role.as_str()) {
            anyhow::bail!("role must be admin, operator, or viewer");
        }

        let id = self.db.create_user(
            &UserRecord {
                id: 0,
                username: payload.username.clone(),
                password_hash: hash_password(&payload.password),
                role: payload.role.clone(),
                created_at: String::new(),
                updated_at: String::new(),
            },
            &AuditEntry::new(&actor.username, "create", "user", &payload.username, "", ip),
        )?;
        Ok(ok_json(serde_json::json!({ "id": id, "username": payload.username })))
    }

    async fn update_user_role(
        &self,
        req: Request<Incoming>,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        if !actor.is_admin() {
            return Ok(error_json(StatusCode::FORBIDDEN, "admin role required"));
        }
        let payload: RoleUpdatePayload = read_json(req).await?;
        if !["admin", "operator", "viewer"].contains(&payload.role.as_str()) {
            anyhow::bail!("role must be admin, operator, or viewer");
        }

        let updated = self.db.update_user_role(
            id,
            &payload.role,
            &AuditEntry::new(&actor.username, "update", "user", id.to_string(), &payload.role, ip),
        )?;
        if !updated {
            return Ok(error_json(StatusCode::NOT_FOUND, "user not found"));
        }
        Ok(ok_json(serde_json::json!({ "id": id, "role": payload.role })))
    }

    async fn update_own_password(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: PasswordUpdatePayload = read_json(req).await?;
        let user = self
            .db
            .get_user(&actor.username)?
            .ok_or_else(|| anyhow::anyhow!("user not found"))?;

        self.db.update_user_password(
            user.id,
            &hash_password(&payload.password),
            &AuditEntry::new(&actor.username, "update-password", "user", &actor.username, "", ip),
        )?;
        Ok(ok_json(serde_json::json!({ "updated": actor.username })))
    }

    async fn delete_user(
        &self,
        id: i64,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        if !actor.is_admin() {
            return Ok(error_json(StatusCode::FORBIDDEN, "admin role required"));
        }
        let deleted = self.db.delete_user(
            id,
            &AuditEntry::new(&actor.username, "delete", "user", id.to_string(), "", ip),
        )?;
        if !deleted {
            return Ok(error_json(StatusCode::NOT_FOUND, "user not found"));
        }
        Ok(ok_json(serde_json::json!({ "deleted": id })))
    }

    // ==================== Misc ====================

    fn list_audit(&self, query: &str) -> anyhow::Result<Response<Full<Bytes>>> {
        let params = parse_query(query);
        let limit = params
            .get("limit")
            .and_then(|l| l.parse::<i64>().ok())
            .unwrap_or(100)
            .clamp(1, 1000);
        let offset = params
            .get("offset")
            .and_then(|o| o.parse::<i64>().ok())
            .unwrap_or(0)
            .max(0);

        let events = self.db.list_audit_events(
            limit,
            offset,
            params.get("username").map(String::as_str),
            params.get("resource_type").map(String::as_str),
        )?;
        Ok(ok_json(events))
    }

    async fn set_error_page(
        &self,
        req: Request<Incoming>,
        actor: &Actor,
        ip: &str,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        let payload: ErrorPagePayload = read_json(req).await?;
        self.db.set_setting(
            "error_page_html",
            &payload.html,
            &AuditEntry::new(&actor.username, "update", "settings", "error-page", "", ip),
        )?;
        self.reconcile().await?;
        Ok(ok_json(serde_json::json!({ "updated": "error-page" })))
    }

    /// Reconcile after a successful write; a build failure surfaces as a
    /// 4xx to the caller while the previous snapshot stays live.
    async fn reconcile(&self) -> anyhow::Result<()> {
        self.publisher
            .reconcile()
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("configuration not applied: {}", e))
    }

    async fn serve_static(&self, path: &str) -> Response<Full<Bytes>> {
        let relative = match path {
            "/" => "index.html",
            other => other.trim_start_matches('/'),
        };

        // No escaping the static root
        if relative.contains("..") {
            return response(StatusCode::FORBIDDEN, "forbidden");
        }

        let full = self.static_dir.join(relative);
        match tokio::fs::read(&full).await {
            Ok(contents) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", content_type_for(relative))
                .body(Full::new(Bytes::from(contents)))
                .expect("valid response builder"),
            Err(_) => response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> anyhow::Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("failed to read body: {}", e))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| anyhow::anyhow!("invalid JSON body: {}", e))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn host_from_subpath(path: &str, suffix: &str) -> anyhow::Result<String> {
    path.strip_prefix("/api/hosts/")
        .and_then(|p| p.strip_suffix(suffix))
        .filter(|d| !d.is_empty())
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("invalid host path"))
}

fn access_list_id(path: &str) -> anyhow::Result<i64> {
    path.strip_prefix("/api/access-lists/")
        .and_then(|rest| rest.split('/').next())
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid access list id"))
}

fn user_id(path: &str) -> anyhow::Result<i64> {
    path.strip_prefix("/api/users/")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid user id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let params = parse_query("limit=10&offset=5&username=alice");
        assert_eq!(params.get("limit").unwrap(), "10");
        assert_eq!(params.get("offset").unwrap(), "5");
        assert_eq!(params.get("username").unwrap(), "alice");
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_host_from_subpath() {
        assert_eq!(
            host_from_subpath("/api/hosts/a.test/locations", "/locations").unwrap(),
            "a.test"
        );
        assert!(host_from_subpath("/api/hosts//locations", "/locations").is_err());
    }

    #[test]
    fn test_access_list_id() {
        assert_eq!(access_list_id("/api/access-lists/7").unwrap(), 7);
        assert_eq!(access_list_id("/api/access-lists/7/clients").unwrap(), 7);
        assert!(access_list_id("/api/access-lists/x").is_err());
    }

    #[test]
    fn test_host_payload_csv_split() {
        let payload: HostPayload = serde_json::from_str(
            r#"{"domain":"a.test","target":"10.0.0.1:9000, 10.0.0.2:9000"}"#,
        )
        .unwrap();
        assert_eq!(
            payload.resolved_targets(),
            vec!["10.0.0.1:9000", "10.0.0.2:9000"]
        );
    }

    #[test]
    fn test_host_payload_list_wins_over_csv() {
        let payload: HostPayload = serde_json::from_str(
            r#"{"domain":"a.test","targets":["10.0.0.3:80"],"target":"ignored:1"}"#,
        )
        .unwrap();
        assert_eq!(payload.resolved_targets(), vec!["10.0.0.3:80"]);
    }

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_string(&ApiResponse::ok(42)).unwrap();
        assert!(ok.contains("\"success\":true"));
        assert!(ok.contains("\"data\":42"));

        let err = serde_json::to_string(&ApiResponse::<()>::error("boom")).unwrap();
        assert!(err.contains("\"success\":false"));
        assert!(err.contains("\"error\":\"boom\""));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}

//! HTTP(S) proxy engine
//!
//! Each listener accepts on one task and hands every connection its own
//! task. A request loads the current snapshot exactly once and keeps that
//! reference for its whole lifetime, so a reconcile mid-request never
//! changes routing decisions already in flight.

use crate::access_log::{AccessLog, AccessLogEntry};
use crate::acme::Http01Challenges;
use crate::error::{empty_response, error_page_response, ProxyErrorCode};
use crate::filters::{
    check_access, force_https_location, resolve_client, AccessDecision, ACME_CHALLENGE_PREFIX,
};
use crate::pool::UpstreamPool;
use crate::snapshot::{rewritten_path, Snapshot, UpstreamScheme};
use crate::stats::StatsCollector;
use arc_swap::ArcSwap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that never cross the proxy boundary
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared state every request handler needs
pub struct ProxyContext {
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub pool: Arc<UpstreamPool>,
    pub stats: Arc<StatsCollector>,
    pub access_log: Arc<AccessLog>,
    pub challenges: Http01Challenges,
    pub trusted_proxies: HashSet<IpAddr>,
}

/// The main reverse proxy server (one instance per listener)
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Serve on a listener the caller already bound (bind failures are
    /// fatal at startup and handled there).
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() {
            "HTTPS"
        } else {
            "HTTP"
        };
        info!(addr = %self.bind_addr, protocol, "Proxy listener up (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "Proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move {
            // The total per-request budget caps the whole pipeline
            let total = ctx.pool.timeouts().total;
            match tokio::time::timeout(total, handle_request(req, Arc::clone(&ctx), addr, is_tls))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(addr = %addr, "Request exceeded total deadline");
                    let template = ctx.snapshot.load().settings.error_page.clone();
                    let response =
                        error_page_response(ProxyErrorCode::UpstreamTimeout, &template);
                    ctx.stats.record(response.status().as_u16(), 0);
                    Ok(response)
                }
            }
        }
    });

    // auto::Builder speaks HTTP/1.1 (with upgrades) and HTTP/2
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    peer_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // One snapshot load per request; this reference rules the whole request
    let snapshot = ctx.snapshot.load_full();

    // 1. ACME challenge, served before any host policy
    if req.method() == Method::GET {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(serve_acme_challenge(&ctx, &snapshot, token).await);
        }
    }

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(finish_local(
                &ctx,
                error_page_response(ProxyErrorCode::ClientProtocol, &snapshot.settings.error_page),
                peer_addr.ip(),
                &req,
                "-",
            ));
        }
    };

    let host = match snapshot.find_host(&hostname) {
        Some(host) => host,
        None => {
            debug!(hostname, "No route for host");
            return Ok(finish_local(
                &ctx,
                error_page_response(ProxyErrorCode::NotFound, &snapshot.settings.error_page),
                peer_addr.ip(),
                &req,
                &hostname,
            ));
        }
    };

    // 2. Trusted-proxy header normalization
    let client = resolve_client(peer_addr.ip(), is_tls, req.headers(), &ctx.trusted_proxies);

    // 3. Access control
    if let Some(list_id) = host.access_list_id {
        if let Some(list) = snapshot.access_list(list_id) {
            let authorization = req
                .headers()
                .get(hyper::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            match check_access(list, client.ip, authorization) {
                AccessDecision::Allow => {}
                AccessDecision::Forbidden => {
                    info!(client_ip = %client.ip, hostname, "Access denied by IP rule");
                    return Ok(finish_local(
                        &ctx,
                        error_page_response(
                            ProxyErrorCode::Forbidden,
                            &snapshot.settings.error_page,
                        ),
                        client.ip,
                        &req,
                        &hostname,
                    ));
                }
                AccessDecision::Unauthorized => {
                    info!(hostname, "Authentication required");
                    let mut response = error_page_response(
                        ProxyErrorCode::Unauthorized,
                        &snapshot.settings.error_page,
                    );
                    response.headers_mut().insert(
                        hyper::header::WWW_AUTHENTICATE,
                        HeaderValue::from_static("Basic realm=\"Restricted\""),
                    );
                    return Ok(finish_local(&ctx, response, client.ip, &req, &hostname));
                }
            }
        }
    }

    // 4. Forced HTTPS wins over any configured redirect
    if host.ssl_forced && !client.https {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = force_https_location(&hostname, path_and_query);
        let response = empty_response(
            StatusCode::MOVED_PERMANENTLY,
            &[("Location", location.as_str())],
        );
        return Ok(finish_local(&ctx, response, client.ip, &req, &hostname));
    }

    // 5. Configured redirect, Location taken verbatim
    if let Some(redirect_to) = host.redirect_to.as_deref().filter(|r| !r.is_empty()) {
        let status = StatusCode::from_u16(host.redirect_status)
            .unwrap_or(StatusCode::MOVED_PERMANENTLY);
        let response = empty_response(status, &[("Location", redirect_to)]);
        return Ok(finish_local(&ctx, response, client.ip, &req, &hostname));
    }

    // 6. Location match decides the upstream set and path rewrite
    let path = req.uri().path().to_string();
    let location = host.match_location(&path);

    let (upstreams, scheme, upstream_sni, verify_ssl) = match location {
        Some(loc) => (
            &loc.upstreams,
            loc.scheme,
            loc.upstream_sni.as_deref(),
            loc.verify_ssl,
        ),
        None => (
            &host.upstreams,
            host.scheme,
            host.upstream_sni.as_deref(),
            host.verify_ssl,
        ),
    };

    let forwarded_path = match location {
        Some(loc) if loc.rewrite => rewritten_path(&loc.path, &path),
        _ => path.clone(),
    };

    // 7. Uniform random endpoint pick; an empty list never dials
    let endpoint = match upstreams.choose(&mut rand::thread_rng()) {
        Some(endpoint) => endpoint.clone(),
        None => {
            warn!(hostname, "No upstream endpoints configured");
            return Ok(finish_local(
                &ctx,
                error_page_response(
                    ProxyErrorCode::UpstreamUnreachable,
                    &snapshot.settings.error_page,
                ),
                client.ip,
                &req,
                &hostname,
            ));
        }
    };

    // WebSocket and other HTTP upgrades ride a dedicated TCP tunnel
    if is_upgrade_request(&req) && scheme == UpstreamScheme::Http {
        return handle_upgrade(req, &ctx, &snapshot, endpoint, hostname, client.ip).await;
    }

    let method = req.method().clone();
    let peer_trusted = ctx.trusted_proxies.contains(&peer_addr.ip());
    let upstream_req = match build_upstream_request(
        req,
        &hostname,
        &forwarded_path,
        &endpoint,
        scheme,
        peer_addr.ip(),
        peer_trusted,
        client.https,
        &host.request_headers,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!(hostname, error = %e, "Failed to build upstream request");
            let response = error_page_response(
                ProxyErrorCode::InternalError,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(500, 0);
            return Ok(response);
        }
    };

    debug!(hostname, endpoint = %endpoint, path = %forwarded_path, "Dispatching upstream");

    let timeouts = ctx.pool.timeouts();
    let result = tokio::time::timeout(
        timeouts.read,
        ctx.pool.send(upstream_req, scheme, verify_ssl, upstream_sni),
    )
    .await;

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop(response.headers_mut());
            apply_header_rules(response.headers_mut(), &host.response_headers);

            let status = response.status().as_u16();
            let entry = AccessLogEntry {
                client_ip: client.ip,
                method: method.to_string(),
                path,
                status,
                body_bytes: 0,
                host: hostname,
            };

            // Count body bytes as they stream to the client; stats and the
            // access line land when the body finishes (or the client goes away)
            let stats = Arc::clone(&ctx.stats);
            let access_log = Arc::clone(&ctx.access_log);
            let counted = response.map(move |body| {
                CountingBody::new(body, move |bytes| {
                    stats.record(status, bytes);
                    let mut entry = entry.clone();
                    entry.body_bytes = bytes;
                    access_log.log(&entry);
                })
                .boxed()
            });
            Ok(counted)
        }
        Ok(Err(e)) => {
            error!(error = %e, endpoint = %endpoint, "Upstream dispatch failed");
            let response = error_page_response(
                ProxyErrorCode::UpstreamUnreachable,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(response.status().as_u16(), 0);
            Ok(response)
        }
        Err(_) => {
            warn!(endpoint = %endpoint, timeout_secs = timeouts.read.as_secs(), "Upstream timed out");
            let response = error_page_response(
                ProxyErrorCode::UpstreamTimeout,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(response.status().as_u16(), 0);
            Ok(response)
        }
    }
}

/// Serve an HTTP-01 token from the worker's store
async fn serve_acme_challenge(
    ctx: &ProxyContext,
    snapshot: &Snapshot,
    token: &str,
) -> Response<ProxyBody> {
    match ctx.challenges.get(token).await {
        Some(key_auth) => {
            debug!(token, "Answering ACME HTTP-01 challenge");
            let len = key_auth.len() as u64;
            ctx.stats.record(200, len);
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(
                    Full::new(Bytes::from(key_auth))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response builder")
        }
        None => {
            debug!(token, "Unknown ACME challenge token");
            let response =
                error_page_response(ProxyErrorCode::NotFound, &snapshot.settings.error_page);
            ctx.stats.record(404, 0);
            response
        }
    }
}

/// Record stats and the access line for a locally generated response
fn finish_local(
    ctx: &ProxyContext,
    response: Response<ProxyBody>,
    client_ip: IpAddr,
    req: &Request<Incoming>,
    host: &str,
) -> Response<ProxyBody> {
    let status = response.status().as_u16();
    let bytes = response.body().size_hint().exact().unwrap_or(0);
    ctx.stats.record(status, bytes);
    ctx.access_log.log(&AccessLogEntry {
        client_ip,
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        status,
        body_bytes: bytes,
        host: host.to_string(),
    });
    response
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Request host key: absolute-form authority first, then the Host header;
/// case-folded with any port stripped.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })?;

    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Reject anything that could smuggle into logs or upstream requests
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

#[allow(clippy::too_many_arguments)]
fn build_upstream_request(
    req: Request<Incoming>,
    hostname: &str,
    forwarded_path: &str,
    endpoint: &str,
    scheme: UpstreamScheme,
    peer_ip: IpAddr,
    peer_trusted: bool,
    client_https: bool,
    request_headers: &[crate::snapshot::HeaderRule],
) -> anyhow::Result<Request<ProxyBody>> {
    let (parts, body) = req.into_parts();

    let scheme_str = match scheme {
        UpstreamScheme::Http => "http",
        UpstreamScheme::Https => "https",
    };
    let uri = match parts.uri.query() {
        Some(query) => format!("{}://{}{}?{}", scheme_str, endpoint, forwarded_path, query),
        None => format!("{}://{}{}", scheme_str, endpoint, forwarded_path),
    };
    let uri: Uri = uri.parse()?;

    let mut builder = Request::builder().method(parts.method).uri(uri);

    let headers = builder
        .headers_mut()
        .ok_or_else(|| anyhow::anyhow!("request builder invalid"))?;
    *headers = parts.headers;
    strip_hop_by_hop(headers);

    // Forwarding chain: append this hop to a trusted peer's list; a
    // client-supplied list from an untrusted peer is discarded
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if peer_trusted => format!("{}, {}", existing, peer_ip),
        _ => peer_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if client_https { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(hostname) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    apply_header_rules(headers, request_headers);

    Ok(builder.body(body.boxed())?)
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Operator header rules replace any existing value of the same name
fn apply_header_rules(headers: &mut hyper::HeaderMap, rules: &[crate::snapshot::HeaderRule]) {
    for rule in rules {
        let name = match HeaderName::from_bytes(rule.name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!(name = %rule.name, "Skipping invalid header rule name");
                continue;
            }
        };
        match HeaderValue::from_str(&rule.value) {
            Ok(value) => {
                headers.remove(&name);
                headers.insert(name, value);
            }
            Err(_) => warn!(name = %rule.name, "Skipping invalid header rule value"),
        }
    }
}

/// A body wrapper that counts data bytes and reports once on completion
struct CountingBody<B, F>
where
    F: FnOnce(u64),
{
    inner: B,
    counted: u64,
    on_complete: Option<F>,
}

impl<B, F> CountingBody<B, F>
where
    F: FnOnce(u64),
{
    fn new(inner: B, on_complete: F) -> Self {
        Self {
            inner,
            counted: 0,
            on_complete: Some(on_complete),
        }
    }

    fn finish(&mut self) {
        if let Some(f) = self.on_complete.take() {
            f(self.counted);
        }
    }
}

impl<B, F> Body for CountingBody<B, F>
where
    B: Body<Data = Bytes> + Unpin,
    F: FnOnce(u64) + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counted += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl<B, F> Drop for CountingBody<B, F>
where
    F: FnOnce(u64),
{
    fn drop(&mut self) {
        // Client went away mid-body: still account for what was sent
        self.finish();
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP request announcing the upgrade to the upstream
fn build_upgrade_request<B>(req: &Request<B>, endpoint: &str, path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", endpoint));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's reply looking for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: &Arc<ProxyContext>,
    snapshot: &Arc<Snapshot>,
    endpoint: String,
    hostname: String,
    client_ip: IpAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    debug!(hostname, endpoint = %endpoint, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &endpoint, path);

    let mut upstream = match TcpStream::connect(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(hostname, endpoint = %endpoint, error = %e, "Upgrade connect failed");
            let response = error_page_response(
                ProxyErrorCode::UpstreamUnreachable,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(502, 0);
            return Ok(response);
        }
    };

    if let Err(e) = upstream.write_all(&raw_request).await {
        error!(hostname, error = %e, "Failed to send upgrade request upstream");
        let response = error_page_response(
            ProxyErrorCode::UpstreamUnreachable,
            &snapshot.settings.error_page,
        );
        ctx.stats.record(502, 0);
        return Ok(response);
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match upstream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        _ => {
            error!(hostname, "Upstream closed before answering upgrade");
            let response = error_page_response(
                ProxyErrorCode::UpstreamUnreachable,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(502, 0);
            return Ok(response);
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(hostname, "Unparsable upgrade response from upstream");
            let response = error_page_response(
                ProxyErrorCode::UpstreamUnreachable,
                &snapshot.settings.error_page,
            );
            ctx.stats.record(502, 0);
            return Ok(response);
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Upstream rejected upgrade");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        ctx.stats.record(status.as_u16(), 0);
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(hostname, "Upgrade accepted, tunneling");
    ctx.stats.record(101, 0);
    ctx.access_log.log(&AccessLogEntry {
        client_ip,
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        status: 101,
        body_bytes: 0,
        host: hostname.clone(),
    });

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, upstream, &hostname).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Client upgrade failed");
            }
        }
    });

    Ok(response)
}

/// Splice bytes between the upgraded client and the upstream connection
async fn forward_bidirectional(client: Upgraded, mut upstream: TcpStream, hostname: &str) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(hostname, to_upstream, to_client, "Tunnel closed normally");
        }
        Err(e) => {
            debug!(hostname, error = %e, "Tunnel closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri("/x")
            .header(hyper::header::HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn test_hostname_folds_and_strips_port() {
        assert_eq!(
            extract_hostname(&request_with_host("Example.COM:8080")),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_hostname_prefers_absolute_form_authority() {
        let req = Request::builder()
            .uri("http://authority.test/x")
            .header(hyper::header::HOST, "header.test")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("authority.test".to_string()));
    }

    #[test]
    fn test_hostname_rejects_injection() {
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host("")), None);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-keep", "1".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn test_apply_header_rules_overwrites() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("x-app", "old".parse().unwrap());

        apply_header_rules(
            &mut headers,
            &[
                crate::snapshot::HeaderRule {
                    name: "X-App".to_string(),
                    value: "new".to_string(),
                },
                crate::snapshot::HeaderRule {
                    name: "X-Extra".to_string(),
                    value: "1".to_string(),
                },
            ],
        );

        assert_eq!(headers.get("x-app").unwrap(), "new");
        assert_eq!(headers.get("x-extra").unwrap(), "1");
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .header(hyper::header::CONNECTION, "Upgrade")
            .header(hyper::header::UPGRADE, "websocket")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let plain = request_with_host("a.test");
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers.iter().any(|(n, v)| n == "Upgrade" && v == "websocket"));
    }

    #[test]
    fn test_build_upgrade_request_sets_endpoint_host() {
        let req = Request::builder()
            .uri("/socket")
            .header(hyper::header::HOST, "a.test")
            .header(hyper::header::UPGRADE, "websocket")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let raw = build_upgrade_request(&req, "10.0.0.1:9000", "/socket");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("GET /socket HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.1:9000\r\n"));
        assert!(!text.contains("Host: a.test"));
    }
}

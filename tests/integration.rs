//! End-to-end tests for routegate
//!
//! Each test stands up the real proxy server on an ephemeral port with an
//! in-memory store behind the snapshot publisher, drives it with raw TCP
//! clients, and observes live behavior.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use routegate::access_log::AccessLog;
use routegate::acme::AcmeWorker;
use routegate::auth::hash_password;
use routegate::db::{
    AuditEntry, ClientRecord, Database, HostRecord, IpRuleRecord, LocationRecord, StreamRecord,
};
use routegate::pool::{PoolConfig, UpstreamPool};
use routegate::proxy::{ProxyContext, ProxyServer};
use routegate::snapshot::Publisher;
use routegate::stats::StatsCollector;
use routegate::streams::StreamForwarder;
use routegate::tls::CertCatalog;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn audit() -> AuditEntry {
    AuditEntry::new("test", "create", "test", "0", "", "127.0.0.1")
}

fn host(domain: &str, target: &str) -> HostRecord {
    HostRecord {
        id: 0,
        domain: domain.to_string(),
        targets: vec![target.to_string()],
        scheme: "http".to_string(),
        upstream_sni: None,
        verify_ssl: true,
        ssl_forced: false,
        redirect_to: None,
        redirect_status: 301,
        access_list_id: None,
    }
}

/// A minimal upstream that answers every request with 200 and a body
/// reporting the path it saw.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    match sock.read(&mut buf[read..]).await {
                        Ok(0) => return,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("?")
                    .to_string();
                let body = format!("hello from {}", path);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

struct TestProxy {
    addr: SocketAddr,
    db: Arc<Database>,
    publisher: Arc<Publisher>,
    stats: Arc<StatsCollector>,
    challenges: routegate::acme::Http01Challenges,
    _shutdown_tx: watch::Sender<bool>,
}

/// Stand up a full proxy instance on an ephemeral port.
///
/// `trusted` is the trusted-proxy set; tests default to empty so the
/// loopback test client is treated as an ordinary untrusted peer.
async fn start_proxy(trusted: &[&str]) -> TestProxy {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let catalog = Arc::new(CertCatalog::new().unwrap());
    let publisher = Arc::new(Publisher::new(Arc::clone(&db), Arc::clone(&catalog)));
    let stats = Arc::new(StatsCollector::new());

    let log_path = std::env::temp_dir().join(format!(
        "routegate-test-{}-{}.log",
        std::process::id(),
        rand_suffix()
    ));
    let access_log = AccessLog::open(&log_path);

    let (acme_worker, acme_handle) = AcmeWorker::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        Arc::clone(&publisher),
        std::env::temp_dir().join("routegate-test-certs"),
    );
    // The worker itself is not under test; park it so the handle works
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { acme_worker.run(shutdown).await });
    }

    let trusted_proxies: HashSet<IpAddr> =
        trusted.iter().map(|ip| ip.parse().unwrap()).collect();

    let ctx = Arc::new(ProxyContext {
        snapshot: publisher.shared(),
        pool: Arc::new(UpstreamPool::new(PoolConfig {
            timeouts: routegate::config::Timeouts {
                connect: Duration::from_secs(2),
                read: Duration::from_secs(5),
                total: Duration::from_secs(10),
            },
            ..PoolConfig::default()
        })),
        stats: Arc::clone(&stats),
        access_log,
        challenges: acme_handle.challenges(),
        trusted_proxies,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, Arc::clone(&ctx), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    TestProxy {
        addr,
        db,
        publisher,
        stats,
        challenges: acme_handle.challenges(),
        _shutdown_tx: shutdown_tx,
    }
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64
}

/// Issue one HTTP/1.1 request over a fresh connection, returning the
/// raw response text.
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&response).to_string()
}

async fn get(addr: SocketAddr, host: &str, path: &str) -> String {
    raw_request(
        addr,
        &format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        ),
    )
    .await
}

#[tokio::test]
async fn basic_proxy_forwards_to_upstream() {
    let proxy = start_proxy(&[]).await;
    let upstream = spawn_upstream().await;

    proxy
        .db
        .upsert_host(&host("a.test", &upstream.to_string()), &audit())
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "a.test", "/x").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("hello from /x"));

    let rt = proxy.stats.realtime();
    assert_eq!(rt.status_2xx, 1);
    assert!(rt.bytes > 0);
}

#[tokio::test]
async fn unknown_host_gets_custom_error_page() {
    let proxy = start_proxy(&[]).await;
    proxy
        .db
        .set_setting("error_page_html", "<h1>oops %%STATUS%%</h1>", &audit())
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "nowhere.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("oops 404 Not Found"));

    assert_eq!(proxy.stats.realtime().status_4xx, 1);
}

#[tokio::test]
async fn config_change_applies_without_restart() {
    let proxy = start_proxy(&[]).await;
    let upstream = spawn_upstream().await;

    // Before the host exists: 404
    let response = get(proxy.addr, "late.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    // Admin adds the host and reconciles; the next request routes
    proxy
        .db
        .upsert_host(&host("late.test", &upstream.to_string()), &audit())
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "late.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
}

#[tokio::test]
async fn forced_https_wins_over_redirect() {
    let proxy = start_proxy(&[]).await;

    let mut record = host("b.test", "10.255.255.1:1");
    record.ssl_forced = true;
    record.redirect_to = Some("https://c.test".to_string());
    record.redirect_status = 301;
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "b.test", "/y?z=1").await;
    assert!(response.starts_with("HTTP/1.1 301"));
    // The forced-HTTPS location preserves host, path, and query; the
    // configured redirect never fires
    assert!(response.contains("location: https://b.test/y?z=1")
        || response.contains("Location: https://b.test/y?z=1"));
    assert!(!response.contains("c.test"));
}

#[tokio::test]
async fn configured_redirect_is_verbatim() {
    let proxy = start_proxy(&[]).await;

    let mut record = host("r.test", "10.255.255.1:1");
    record.redirect_to = Some("https://elsewhere.test/landing".to_string());
    record.redirect_status = 302;
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "r.test", "/ignored/path").await;
    assert!(response.starts_with("HTTP/1.1 302"));
    assert!(response.to_lowercase().contains("location: https://elsewhere.test/landing"));
}

#[tokio::test]
async fn location_rewrite_strips_prefix() {
    let proxy = start_proxy(&[]).await;
    let default_upstream = spawn_upstream().await;
    let api_upstream = spawn_upstream().await;

    let host_id = proxy
        .db
        .upsert_host(&host("d.test", &default_upstream.to_string()), &audit())
        .unwrap();
    proxy
        .db
        .upsert_location(
            &LocationRecord {
                id: 0,
                host_id,
                path: "/api".to_string(),
                targets: vec![api_upstream.to_string()],
                scheme: "http".to_string(),
                upstream_sni: None,
                verify_ssl: true,
                rewrite: true,
                position: 0,
            },
            &audit(),
        )
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    // The location upstream sees the prefix stripped
    let response = get(proxy.addr, "d.test", "/api/v1/users").await;
    assert!(response.contains("hello from /v1/users"), "got: {}", response);

    // Unmatched paths ride the host default with no rewrite
    let response = get(proxy.addr, "d.test", "/other").await;
    assert!(response.contains("hello from /other"));
}

#[tokio::test]
async fn acl_allow_list_rejects_unmatched_client() {
    // Loopback is NOT in the trusted set here, so the effective client
    // is the socket peer 127.0.0.1
    let proxy = start_proxy(&[]).await;
    let upstream = spawn_upstream().await;

    let list_id = proxy.db.create_access_list("office", &audit()).unwrap();
    proxy
        .db
        .add_ip_rule(
            &IpRuleRecord {
                id: 0,
                list_id,
                ip: "10.0.0.0/8".to_string(),
                action: "allow".to_string(),
                position: 0,
            },
            &audit(),
        )
        .unwrap();

    let mut record = host("e.test", &upstream.to_string());
    record.access_list_id = Some(list_id);
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    // 127.0.0.1 does not match the 10/8 whitelist
    let response = get(proxy.addr, "e.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);

    // A spoofed X-Forwarded-For from an untrusted peer changes nothing
    let spoofed = raw_request(
        proxy.addr,
        "GET / HTTP/1.1\r\nHost: e.test\r\nX-Forwarded-For: 10.1.2.3\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(spoofed.starts_with("HTTP/1.1 403"));
}

#[tokio::test]
async fn acl_honors_forwarded_ip_from_trusted_proxy() {
    // Loopback IS trusted here: the left-most X-Forwarded-For entry
    // becomes the effective client
    let proxy = start_proxy(&["127.0.0.1"]).await;
    let upstream = spawn_upstream().await;

    let list_id = proxy.db.create_access_list("office", &audit()).unwrap();
    proxy
        .db
        .add_ip_rule(
            &IpRuleRecord {
                id: 0,
                list_id,
                ip: "10.0.0.0/8".to_string(),
                action: "allow".to_string(),
                position: 0,
            },
            &audit(),
        )
        .unwrap();

    let mut record = host("e.test", &upstream.to_string());
    record.access_list_id = Some(list_id);
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let allowed = raw_request(
        proxy.addr,
        "GET / HTTP/1.1\r\nHost: e.test\r\nX-Forwarded-For: 10.1.2.3\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(allowed.starts_with("HTTP/1.1 200"), "got: {}", allowed);

    let denied = raw_request(
        proxy.addr,
        "GET / HTTP/1.1\r\nHost: e.test\r\nX-Forwarded-For: 192.0.2.5\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(denied.starts_with("HTTP/1.1 403"));
}

#[tokio::test]
async fn acl_basic_auth_challenge_and_accept() {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let proxy = start_proxy(&[]).await;
    let upstream = spawn_upstream().await;

    let list_id = proxy.db.create_access_list("users", &audit()).unwrap();
    proxy
        .db
        .upsert_client(
            &ClientRecord {
                list_id,
                username: "alice".to_string(),
                password_hash: hash_password("secret"),
            },
            &audit(),
        )
        .unwrap();

    let mut record = host("auth.test", &upstream.to_string());
    record.access_list_id = Some(list_id);
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let challenge = get(proxy.addr, "auth.test", "/").await;
    assert!(challenge.starts_with("HTTP/1.1 401"));
    assert!(challenge.contains("Basic realm=\"Restricted\""));

    let credentials = STANDARD.encode("alice:secret");
    let accepted = raw_request(
        proxy.addr,
        &format!(
            "GET / HTTP/1.1\r\nHost: auth.test\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
            credentials
        ),
    )
    .await;
    assert!(accepted.starts_with("HTTP/1.1 200"), "got: {}", accepted);
}

#[tokio::test]
async fn acme_challenge_served_before_host_policy() {
    let proxy = start_proxy(&[]).await;

    proxy
        .challenges
        .set("tok42".to_string(), "tok42.keyauth".to_string())
        .await;

    // No host configured at all; the token is still served over plain HTTP
    let response = get(proxy.addr, "whatever.test", "/.well-known/acme-challenge/tok42").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("text/plain"));
    assert!(response.contains("tok42.keyauth"));

    let missing = get(proxy.addr, "whatever.test", "/.well-known/acme-challenge/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn empty_upstream_list_yields_502_without_dialing() {
    let proxy = start_proxy(&[]).await;

    let mut record = host("empty.test", "placeholder");
    record.targets = Vec::new();
    proxy.db.upsert_host(&record, &audit()).unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "empty.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    assert_eq!(proxy.stats.realtime().status_5xx, 1);
}

#[tokio::test]
async fn unreachable_upstream_yields_502() {
    let proxy = start_proxy(&[]).await;

    // Nothing listens on this port
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    proxy
        .db
        .upsert_host(&host("down.test", &dead_addr.to_string()), &audit())
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "down.test", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
}

#[tokio::test]
async fn request_header_rules_reach_upstream() {
    let proxy = start_proxy(&[]).await;

    // Upstream that echoes the whole request back in the body
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    match sock.read(&mut buf[read..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let seen = String::from_utf8_lossy(&buf[..read]).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    seen.len(),
                    seen
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    let host_id = proxy
        .db
        .upsert_host(&host("h.test", &upstream_addr.to_string()), &audit())
        .unwrap();
    proxy
        .db
        .add_header(
            &routegate::db::HeaderRecord {
                id: 0,
                host_id,
                name: "X-Injected".to_string(),
                value: "by-proxy".to_string(),
                direction: "request".to_string(),
            },
            &audit(),
        )
        .unwrap();
    proxy.publisher.reconcile().await.unwrap();

    let response = get(proxy.addr, "h.test", "/").await;
    assert!(response.contains("X-Injected: by-proxy") || response.contains("x-injected: by-proxy"));
    // The untrusted client's identity is forwarded
    assert!(response.to_lowercase().contains("x-forwarded-for: 127.0.0.1"));
    assert!(response.to_lowercase().contains("x-forwarded-host: h.test"));
}

#[tokio::test]
async fn stream_listener_follows_reconcile() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let catalog = Arc::new(CertCatalog::new().unwrap());
    let publisher = Arc::new(Publisher::new(Arc::clone(&db), catalog));
    let stats = Arc::new(StatsCollector::new());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let forwarder = StreamForwarder::new(stats);
    let publish_rx = publisher.subscribe();
    tokio::spawn(async move {
        forwarder.run(publish_rx, shutdown_rx).await;
    });

    // Echo upstream for the forward target
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match upstream.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = sock.read(&mut buf).await {
                    let _ = sock.write_all(&buf[..n]).await;
                }
            });
        }
    });

    // Pick a free port for the stream listener
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_port = probe.local_addr().unwrap().port();
    drop(probe);

    // Snapshot N: no streams; connecting is refused
    publisher.reconcile().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", listen_port)).await.is_err());

    // Admin adds the stream row; snapshot N+1 binds the listener
    db.upsert_stream(
        &StreamRecord {
            listen_port,
            protocol: "tcp".to_string(),
            forward_host: "127.0.0.1".to_string(),
            forward_port: upstream_port,
        },
        &audit(),
    )
    .unwrap();
    publisher.reconcile().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Admin deletes the row; new connections are refused after reconcile
    db.delete_stream(listen_port, &audit()).unwrap();
    publisher.reconcile().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect(("127.0.0.1", listen_port)).await.is_err());
}

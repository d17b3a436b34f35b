//! L4 stream forwarder
//!
//! Owns one listener task per configured stream. On every snapshot
//! publication the active set is diffed against the desired set keyed by
//! (protocol, listen port): new entries open a listener, removed entries
//! close theirs, and entries whose forward target changed are closed and
//! reopened. TCP closures stop accepting and give established
//! connections a 30 second drain; UDP closures drop the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::snapshot::{Snapshot, StreamKey, StreamProtocol, StreamRoute};
use crate::stats::StatsCollector;

/// Drain window for established TCP connections after a stream is removed
const TCP_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Idle eviction for UDP client mappings
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const UDP_BUFFER_SIZE: usize = 65535;

struct ActiveStream {
    route: StreamRoute,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct StreamForwarder {
    stats: Arc<StatsCollector>,
    active: HashMap<StreamKey, ActiveStream>,
}

impl StreamForwarder {
    pub fn new(stats: Arc<StatsCollector>) -> Self {
        Self {
            stats,
            active: HashMap::new(),
        }
    }

    /// Run until shutdown, reconciling on every snapshot publication.
    pub async fn run(
        mut self,
        mut publish_rx: watch::Receiver<Arc<Snapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // Apply whatever snapshot is already installed
        let initial = publish_rx.borrow().clone();
        self.apply(&initial).await;

        loop {
            tokio::select! {
                changed = publish_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = publish_rx.borrow_and_update().clone();
                    self.apply(&snapshot).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stream forwarder shutting down");
                        break;
                    }
                }
            }
        }

        for (key, stream) in self.active.drain() {
            debug!(port = key.listen_port, "Closing stream listener on shutdown");
            let _ = stream.shutdown_tx.send(true);
            stream.handle.abort();
        }
    }

    /// Diff-apply a snapshot's stream table. Failures are logged per
    /// port and never roll back unrelated changes.
    async fn apply(&mut self, snapshot: &Snapshot) {
        let desired: HashMap<StreamKey, &StreamRoute> = snapshot
            .streams
            .values()
            .map(|route| (route.key(), route))
            .collect();

        // Close removed or retargeted streams
        let stale: Vec<StreamKey> = self
            .active
            .iter()
            .filter(|(key, active)| {
                desired
                    .get(key)
                    .map(|route| **route != active.route)
                    .unwrap_or(true)
            })
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            if let Some(stream) = self.active.remove(&key) {
                info!(
                    port = key.listen_port,
                    protocol = ?key.protocol,
                    "Closing stream listener"
                );
                let _ = stream.shutdown_tx.send(true);
            }
        }

        // Open new ones
        for (key, route) in desired {
            if self.active.contains_key(&key) {
                continue;
            }
            match self.open(route.clone()).await {
                Ok(active) => {
                    self.active.insert(key, active);
                }
                Err(e) => {
                    error!(
                        port = route.listen_port,
                        error = %e,
                        "Failed to open stream listener"
                    );
                }
            }
        }
    }

    async fn open(&self, route: StreamRoute) -> anyhow::Result<ActiveStream> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);

        info!(
            port = route.listen_port,
            protocol = ?route.protocol,
            forward = %route.forward_addr(),
            "Opening stream listener"
        );

        let handle = match route.protocol {
            StreamProtocol::Tcp => {
                let listener =
                    TcpListener::bind(("0.0.0.0", route.listen_port)).await?;
                let route_clone = route.clone();
                tokio::spawn(async move {
                    run_tcp_stream(listener, route_clone, stats, shutdown_rx).await;
                })
            }
            StreamProtocol::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", route.listen_port)).await?;
                let route_clone = route.clone();
                tokio::spawn(async move {
                    run_udp_stream(socket, route_clone, stats, shutdown_rx).await;
                })
            }
        };

        Ok(ActiveStream {
            route,
            shutdown_tx,
            handle,
        })
    }
}

/// Accept loop for one TCP stream
async fn run_tcp_stream(
    listener: TcpListener,
    route: StreamRoute,
    stats: Arc<StatsCollector>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (inbound, client_addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(port = route.listen_port, error = %e, "TCP accept failed");
                        continue;
                    }
                };

                stats.record_stream_connection();
                let forward = route.forward_addr();
                let conn_stats = Arc::clone(&stats);
                let conn_shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    relay_tcp(inbound, client_addr, forward, conn_stats, conn_shutdown).await;
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(port = route.listen_port, "TCP listener stopped accepting");
                    break;
                }
            }
        }
    }
    // Dropping the listener frees the port; established relays drain on
    // their own shutdown receivers.
}

/// Splice one accepted connection to the upstream until either side
/// closes, or the drain grace expires after the stream was removed.
async fn relay_tcp(
    mut inbound: TcpStream,
    client_addr: SocketAddr,
    forward: String,
    stats: Arc<StatsCollector>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut outbound = match TcpStream::connect(&forward).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(forward = %forward, error = %e, "TCP upstream connect failed");
            return;
        }
    };

    let drain = async {
        loop {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *shutdown_rx.borrow() {
                tokio::time::sleep(TCP_DRAIN_GRACE).await;
                return;
            }
        }
    };

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            match result {
                Ok((to_upstream, to_client)) => {
                    stats.record_stream_bytes(to_upstream + to_client);
                    debug!(client = %client_addr, to_upstream, to_client, "TCP relay closed");
                }
                Err(e) => {
                    debug!(client = %client_addr, error = %e, "TCP relay error");
                }
            }
        }
        _ = drain => {
            warn!(client = %client_addr, "TCP relay cut off after drain grace");
        }
    }
}

/// NAT-style relay for one UDP stream
async fn run_udp_stream(
    socket: UdpSocket,
    route: StreamRoute,
    stats: Arc<StatsCollector>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = Arc::new(socket);
    let sessions: Arc<DashMap<SocketAddr, Arc<UdpSocket>>> = Arc::new(DashMap::new());
    let forward = route.forward_addr();
    let mut buf = [0u8; UDP_BUFFER_SIZE];

    loop {
        let (len, src_addr) = tokio::select! {
            result = listener.recv_from(&mut buf) => {
                match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(port = route.listen_port, error = %e, "UDP recv failed");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(port = route.listen_port, "UDP socket closed");
                    break;
                }
                continue;
            }
        };

        let data = &buf[..len];
        stats.record_stream_bytes(len as u64);

        let upstream = match sessions.get(&src_addr) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let new_socket = match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        error!(error = %e, "UDP upstream socket bind failed");
                        continue;
                    }
                };
                if let Err(e) = new_socket.connect(&forward).await {
                    error!(forward = %forward, error = %e, "UDP upstream connect failed");
                    continue;
                }

                stats.record_stream_connection();
                sessions.insert(src_addr, Arc::clone(&new_socket));

                // Reply path: upstream -> originating client, with idle eviction
                let listener_clone = Arc::clone(&listener);
                let upstream_clone = Arc::clone(&new_socket);
                let sessions_clone = Arc::clone(&sessions);
                let reply_stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    let mut resp_buf = [0u8; UDP_BUFFER_SIZE];
                    loop {
                        match timeout(UDP_IDLE_TIMEOUT, upstream_clone.recv(&mut resp_buf)).await {
                            Ok(Ok(n)) => {
                                reply_stats.record_stream_bytes(n as u64);
                                if let Err(e) =
                                    listener_clone.send_to(&resp_buf[..n], src_addr).await
                                {
                                    debug!(error = %e, "UDP reply send failed");
                                    break;
                                }
                            }
                            _ => {
                                debug!(client = %src_addr, "UDP mapping evicted");
                                sessions_clone.remove(&src_addr);
                                break;
                            }
                        }
                    }
                });

                new_socket
            }
        };

        if let Err(e) = upstream.send(data).await {
            error!(forward = %forward, error = %e, "UDP forward failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(port: u16, proto: StreamProtocol, forward_port: u16) -> StreamRoute {
        StreamRoute {
            listen_port: port,
            protocol: proto,
            forward_host: "127.0.0.1".to_string(),
            forward_port,
        }
    }

    fn snapshot_with(routes: Vec<StreamRoute>) -> Arc<Snapshot> {
        let mut snapshot = Snapshot::empty();
        for r in routes {
            snapshot.streams.insert(r.listen_port, r);
        }
        Arc::new(snapshot)
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_apply_opens_and_closes_tcp_listener() {
        let stats = Arc::new(StatsCollector::new());
        let mut forwarder = StreamForwarder::new(Arc::clone(&stats));

        let port = free_port().await;
        let upstream_port = free_port().await;

        forwarder
            .apply(&snapshot_with(vec![route(
                port,
                StreamProtocol::Tcp,
                upstream_port,
            )]))
            .await;

        // The listener is bound: a connect succeeds
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

        // Removing the row closes the listener
        forwarder.apply(&snapshot_with(vec![])).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_relay_end_to_end() {
        let stats = Arc::new(StatsCollector::new());
        let mut forwarder = StreamForwarder::new(Arc::clone(&stats));

        // Echo upstream
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
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    if let Ok(n) = sock.read(&mut buf).await {
                        let _ = sock.write_all(&buf[..n]).await;
                    }
                });
            }
        });

        let port = free_port().await;
        forwarder
            .apply(&snapshot_with(vec![route(
                port,
                StreamProtocol::Tcp,
                upstream_port,
            )]))
            .await;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(stats.realtime().requests == 0); // L4 traffic is not HTTP traffic
    }

    #[tokio::test]
    async fn test_retarget_reopens_listener() {
        let stats = Arc::new(StatsCollector::new());
        let mut forwarder = StreamForwarder::new(stats);

        let port = free_port().await;
        let first = route(port, StreamProtocol::Tcp, 19000);
        forwarder.apply(&snapshot_with(vec![first.clone()])).await;
        let key = first.key();
        assert_eq!(forwarder.active[&key].route.forward_port, 19000);

        let second = route(port, StreamProtocol::Tcp, 19001);
        forwarder.apply(&snapshot_with(vec![second])).await;
        assert_eq!(forwarder.active[&key].route.forward_port, 19001);
    }

    #[tokio::test]
    async fn test_udp_relay_end_to_end() {
        let stats = Arc::new(StatsCollector::new());
        let mut forwarder = StreamForwarder::new(Arc::clone(&stats));

        // Echo upstream
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                if let Ok((n, from)) = upstream.recv_from(&mut buf).await {
                    let _ = upstream.send_to(&buf[..n], from).await;
                }
            }
        });

        let port = free_port().await;
        forwarder
            .apply(&snapshot_with(vec![route(
                port,
                StreamProtocol::Udp,
                upstream_port,
            )]))
            .await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", port)).await.unwrap();
        client.send(b"dgram").await.unwrap();

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply within deadline")
            .unwrap();
        assert_eq!(&buf[..n], b"dgram");
    }
}

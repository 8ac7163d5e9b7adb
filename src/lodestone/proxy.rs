use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{watch, RwLock, Semaphore},
    time,
};

use crate::lodestone::{
    filter::Filters,
    limiter::ConnectionLimiter,
    net,
    notify::{ConnectionEvent, ConnectionNotifier},
    protocol::{self, Sniff},
    proxy_protocol,
    router::RouteTable,
    scaler::{DownScaler, WakeGate, Waker},
    telemetry,
};

/// Everything that can end a connection before or instead of a normal
/// splice. Each variant names the state-machine stage it belongs to; the
/// metric label comes from [`ConnectionError::kind`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("bad client: {0}")]
    BadClient(String),
    #[error("{0} rejected by filter")]
    Filtered(&'static str),
    #[error("no route")]
    NoRoute,
    #[error("wake failed: {0}")]
    WakeFailed(String),
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("relay aborted: {0}")]
    RelayAborted(String),
    #[error("shutting down")]
    Shutdown,
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl ConnectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::BadClient(_) => "bad_client",
            ConnectionError::Filtered(_) => "filtered",
            ConnectionError::NoRoute => "no_route",
            ConnectionError::WakeFailed(_) => "wake_failed",
            ConnectionError::DialFailed(_) => "dial_failed",
            ConnectionError::RelayAborted(_) => "relay_aborted",
            ConnectionError::Shutdown => "shutdown",
            ConnectionError::Internal(_) => "internal",
        }
    }
}

/// Knobs the reload loop may swap while connections are in flight. Each
/// handler snapshots this once at accept.
#[derive(Debug, Clone)]
pub struct GatewayRuntime {
    pub sniff_timeout: Duration,
    pub dial_timeout: Duration,
    pub wake_timeout: Duration,
    /// Per-direction read deadline during splice. Zero disables.
    pub idle_timeout: Duration,
    /// Upper bound on a whole connection. Zero disables.
    pub max_lifetime: Duration,
    pub filters: Arc<Filters>,
    /// Chat text sent in the disconnect packet on player-filter rejection.
    pub reject_message: String,
}

pub struct Gateway {
    pub table: Arc<RouteTable>,
    pub scaler: DownScaler,
    pub wake_gate: WakeGate,
    pub waker: Option<Arc<dyn Waker>>,
    pub notifier: Option<Arc<dyn ConnectionNotifier>>,
    pub limiter: Arc<ConnectionLimiter>,
    /// Caps concurrent live handlers; excess accepts are dropped unread.
    pub permits: Arc<Semaphore>,
    pub sessions: telemetry::SharedSessions,
    pub runtime: Arc<RwLock<GatewayRuntime>>,
}

pub async fn serve(
    listen_addr: &str,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = net::normalize_bind_addr(listen_addr);
    let listener = TcpListener::bind(addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {addr}"))?;

    tracing::info!(listen_addr = %addr, "gateway: listening");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (conn, peer) = accepted?;
                telemetry::record_accepted();

                // Admit: rate limit and the global cap both drop without
                // reading a single byte.
                if !gateway.limiter.admit(peer.ip()) {
                    telemetry::record_rate_limited();
                    tracing::debug!(client = %peer, "gateway: rate limited");
                    continue;
                }
                let Ok(permit) = gateway.permits.clone().try_acquire_owned() else {
                    telemetry::record_rate_limited();
                    tracing::debug!(client = %peer, "gateway: connection cap reached");
                    continue;
                };

                let gw = gateway.clone();
                let sd = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(conn, peer, gw, sd).await;
                });
            }
        }
    }

    tracing::info!("gateway: listener stopped");
    Ok(())
}

async fn handle_connection(
    conn: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(rejected) = drive(conn, peer, &gateway, shutdown).await {
        telemetry::record_error(rejected.error.kind(), rejected.host.as_deref());
        let host = rejected.host.as_deref().unwrap_or("");
        match &rejected.error {
            ConnectionError::Internal(_) => {
                tracing::error!(client = %peer, host = %host, err = %rejected.error, "gateway: connection failed");
            }
            err => {
                tracing::debug!(client = %peer, host = %host, err = %err, "gateway: connection closed early");
            }
        }
    }
}

struct Rejected {
    error: ConnectionError,
    host: Option<String>,
}

impl Rejected {
    fn new(error: ConnectionError) -> Self {
        Self { error, host: None }
    }

    fn at(error: ConnectionError, host: &str) -> Self {
        Self {
            error,
            host: Some(host.to_string()),
        }
    }
}

/// The per-connection state machine: sniff → filter → resolve → wake → dial
/// → splice → account. Strictly sequential; every early exit closes only
/// this connection.
async fn drive(
    mut conn: TcpStream,
    peer: SocketAddr,
    gateway: &Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Rejected> {
    let rt = gateway.runtime.read().await.clone();

    // Filter-IP: denied clients are closed before any byte is read.
    if !rt.filters.ip_allowed(peer.ip()) {
        return Err(Rejected::new(ConnectionError::Filtered("ip")));
    }

    // Sniff within the read deadline.
    let sniffed = match time::timeout(rt.sniff_timeout, protocol::sniff(&mut conn)).await {
        Ok(Ok(sniffed)) => sniffed,
        Ok(Err(err)) => {
            let _ = conn.shutdown().await;
            return Err(Rejected::new(ConnectionError::BadClient(err.to_string())));
        }
        Err(_) => {
            let _ = conn.shutdown().await;
            return Err(Rejected::new(ConnectionError::BadClient(
                "handshake read timed out".to_string(),
            )));
        }
    };

    let (handshake, player, captured) = match sniffed {
        Sniff::LegacyPing => {
            // Not an error: close cleanly, touch nothing.
            telemetry::record_legacy_ping();
            tracing::debug!(client = %peer, "gateway: legacy ping");
            let _ = conn.shutdown().await;
            return Ok(());
        }
        Sniff::Handshake {
            handshake,
            player,
            raw,
        } => (handshake, player, raw),
    };

    let host = gateway.table.normalize(&handshake.server_address);

    // Filter-player applies only when a LoginStart was sniffed.
    if let Some(name) = &player {
        if !rt.filters.player_allowed(name) {
            let _ = conn
                .write_all(&protocol::disconnect_packet(&rt.reject_message))
                .await;
            let _ = conn.shutdown().await;
            if let Some(notifier) = &gateway.notifier {
                let notifier = notifier.clone();
                let event = ConnectionEvent {
                    client: peer.to_string(),
                    host: host.clone(),
                    backend: String::new(),
                    player: player.clone(),
                    reason: Some("filtered"),
                };
                tokio::spawn(async move { notifier.disconnected(event).await });
            }
            return Err(Rejected::at(ConnectionError::Filtered("player"), &host));
        }
    }

    // Resolve: exact key, then the default slot.
    let (_, resolved) = gateway.table.lookup(&host);
    let Some(found) = resolved else {
        let _ = conn.shutdown().await;
        return Err(Rejected::at(ConnectionError::NoRoute, &host));
    };
    let route = found.route;
    let backend = net::ensure_port(&route.backend, net::DEFAULT_GAME_PORT);
    telemetry::record_route_hit(&host);

    // Wake: only when nothing is currently spliced to this backend. The
    // gate collapses racing wakes into one waker call.
    if let (Some(waker_id), Some(waker)) = (&route.waker, &gateway.waker) {
        if gateway.scaler.active_count(waker_id) == 0 {
            match gateway
                .wake_gate
                .ensure_awake(waker, waker_id, &backend, rt.wake_timeout)
                .await
            {
                Ok(()) => telemetry::record_wake("ok"),
                Err(reason) => {
                    telemetry::record_wake("failed");
                    let _ = conn.shutdown().await;
                    return Err(Rejected::at(ConnectionError::WakeFailed(reason), &host));
                }
            }
        }
    }

    if *shutdown.borrow() {
        let _ = conn.shutdown().await;
        return Err(Rejected::at(ConnectionError::Shutdown, &host));
    }

    // Dial.
    let mut upstream = match time::timeout(rt.dial_timeout, TcpStream::connect(&backend)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            let _ = conn.shutdown().await;
            return Err(Rejected::at(
                ConnectionError::DialFailed(format!("{backend}: {err}")),
                &host,
            ));
        }
        Err(_) => {
            let _ = conn.shutdown().await;
            return Err(Rejected::at(
                ConnectionError::DialFailed(format!("{backend}: connect timed out")),
                &host,
            ));
        }
    };

    // Replay the captured handshake verbatim, PROXY header first when the
    // route carries one.
    if let Ok(local) = conn.local_addr() {
        if let Some(header) = proxy_protocol::encode(route.proxy_protocol, peer, local) {
            if let Err(err) = upstream.write_all(&header).await {
                let _ = conn.shutdown().await;
                return Err(Rejected::at(
                    ConnectionError::RelayAborted(format!("proxy header: {err}")),
                    &host,
                ));
            }
        }
    }
    if let Err(err) = upstream.write_all(&captured).await {
        let _ = conn.shutdown().await;
        return Err(Rejected::at(
            ConnectionError::RelayAborted(format!("handshake replay: {err}")),
            &host,
        ));
    }

    tracing::debug!(client = %peer, host = %host, backend = %backend, "gateway: routed");

    // Account. The scale key is the waker-id when one is bound (several
    // hostnames may share a backend), otherwise the backend address.
    let wakeable = route.waker.is_some();
    let scale_key = route.waker.unwrap_or_else(|| backend.clone());
    gateway.scaler.on_connected(&scale_key);
    telemetry::inc_active();

    let sid = telemetry::new_session_id();
    gateway.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: peer.to_string(),
        host: host.clone(),
        backend: backend.clone(),
        player: player.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    if let Some(notifier) = &gateway.notifier {
        let notifier = notifier.clone();
        let event = ConnectionEvent {
            client: peer.to_string(),
            host: host.clone(),
            backend: backend.clone(),
            player: player.clone(),
            reason: None,
        };
        tokio::spawn(async move { notifier.connected(event).await });
    }

    let outcome = splice(conn, upstream, rt.idle_timeout, rt.max_lifetime).await;

    gateway.sessions.remove(&sid);
    telemetry::dec_active();
    gateway.scaler.on_disconnected(&scale_key, wakeable);
    telemetry::record_bytes(outcome.to_backend, outcome.to_client);

    let reason = match &outcome.error {
        None => None,
        Some(err) => {
            telemetry::record_error("relay_aborted", Some(&host));
            tracing::debug!(client = %peer, host = %host, err = %err, "gateway: relay aborted");
            Some("relay_aborted")
        }
    };
    tracing::debug!(
        client = %peer,
        host = %host,
        to_backend = outcome.to_backend,
        to_client = outcome.to_client,
        "gateway: session ended"
    );

    if let Some(notifier) = &gateway.notifier {
        let notifier = notifier.clone();
        let event = ConnectionEvent {
            client: peer.to_string(),
            host,
            backend,
            player,
            reason,
        };
        tokio::spawn(async move { notifier.disconnected(event).await });
    }

    Ok(())
}

struct SpliceOutcome {
    to_backend: u64,
    to_client: u64,
    error: Option<std::io::Error>,
}

/// Two unidirectional copies run in parallel. The direction that sees EOF
/// first shuts down the opposite write half so the peer observes it; the
/// other direction drains on its own. `max_lifetime` bounds the whole
/// exchange.
async fn splice(
    client: TcpStream,
    upstream: TcpStream,
    idle: Duration,
    max_lifetime: Duration,
) -> SpliceOutcome {
    let (client_rd, client_wr) = client.into_split();
    let (upstream_rd, upstream_wr) = upstream.into_split();

    let copies = async {
        tokio::join!(
            pipe(client_rd, upstream_wr, idle),
            pipe(upstream_rd, client_wr, idle),
        )
    };

    let ((to_backend, err_up), (to_client, err_down)) = if max_lifetime > Duration::ZERO {
        match time::timeout(max_lifetime, copies).await {
            Ok(done) => done,
            Err(_) => {
                // Dropping the halves force-closes both sockets.
                return SpliceOutcome {
                    to_backend: 0,
                    to_client: 0,
                    error: Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection lifetime exceeded",
                    )),
                };
            }
        }
    } else {
        copies.await
    };

    SpliceOutcome {
        to_backend,
        to_client,
        error: err_up.or(err_down),
    }
}

async fn pipe(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    idle: Duration,
) -> (u64, Option<std::io::Error>) {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    let error = loop {
        let read = if idle > Duration::ZERO {
            match time::timeout(idle, rd.read(&mut buf)).await {
                Ok(res) => res,
                Err(_) => {
                    break Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "idle timeout",
                    ))
                }
            }
        } else {
            rd.read(&mut buf).await
        };
        match read {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(err) = wr.write_all(&buf[..n]).await {
                    break Some(err);
                }
                total += n as u64;
            }
            Err(err) => break Some(err),
        }
    };
    let _ = wr.shutdown().await;
    (total, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodestone::{
        protocol::{encode_frame, write_string, write_varint},
        router::{ProxyProtocol, Route, RouteSource},
        telemetry::SessionRegistry,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn mk_handshake(host: &str, next_state: i32) -> Vec<u8> {
        let mut inner = Vec::new();
        write_varint(&mut inner, 0);
        write_varint(&mut inner, 763);
        write_string(&mut inner, host);
        inner.extend(25565u16.to_be_bytes());
        write_varint(&mut inner, next_state);
        encode_frame(&inner)
    }

    fn mk_login(name: &str) -> Vec<u8> {
        let mut inner = Vec::new();
        write_varint(&mut inner, 0);
        write_string(&mut inner, name);
        encode_frame(&inner)
    }

    fn runtime() -> GatewayRuntime {
        GatewayRuntime {
            sniff_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(2),
            wake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            filters: Arc::new(Filters::default()),
            reject_message: "not allowed".to_string(),
        }
    }

    fn gateway(
        table: Arc<RouteTable>,
        waker: Option<Arc<dyn Waker>>,
        notifier: Option<Arc<dyn ConnectionNotifier>>,
        rt: GatewayRuntime,
    ) -> Arc<Gateway> {
        Arc::new(Gateway {
            table,
            scaler: DownScaler::new(waker.clone(), Duration::from_secs(600), waker.is_some()),
            wake_gate: WakeGate::new(),
            waker,
            notifier,
            limiter: Arc::new(ConnectionLimiter::new(16, 0.0)),
            permits: Arc::new(Semaphore::new(64)),
            sessions: Arc::new(SessionRegistry::new()),
            runtime: Arc::new(RwLock::new(rt)),
        })
    }

    /// Backend that records everything it receives until the client side
    /// closes.
    async fn capture_backend() -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            buf
        });
        (addr, task)
    }

    /// A connected (client, server-side) socket pair over loopback.
    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    fn never_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(&'static str, ConnectionEvent)>>,
    }

    #[async_trait]
    impl ConnectionNotifier for RecordingNotifier {
        async fn connected(&self, event: ConnectionEvent) {
            self.events.lock().unwrap().push(("connected", event));
        }

        async fn disconnected(&self, event: ConnectionEvent) {
            self.events.lock().unwrap().push(("disconnected", event));
        }
    }

    #[tokio::test]
    async fn login_flow_replays_bytes_and_accounts() {
        let (backend_addr, captured) = capture_backend().await;
        let table = Arc::new(RouteTable::new(false));
        table.set(
            "mc.example.com",
            Route::new(backend_addr.clone(), RouteSource::Api),
        );
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw.clone(),
            never_shutdown(),
        ));

        let mut sent = mk_handshake("mc.example.com", 2);
        sent.extend(mk_login("Alice"));
        client.write_all(&sent).await.unwrap();
        client.shutdown().await.unwrap();
        let mut from_backend = Vec::new();
        client.read_to_end(&mut from_backend).await.unwrap();

        handler.await.unwrap();
        assert_eq!(captured.await.unwrap(), sent);
        assert_eq!(gw.scaler.active_count(&backend_addr), 0);
        assert!(gw.sessions.snapshot().is_empty());
    }

    #[tokio::test]
    async fn miss_falls_back_to_default_route() {
        let (backend_addr, captured) = capture_backend().await;
        let table = Arc::new(RouteTable::new(false));
        table.set_default(Route::new(backend_addr, RouteSource::Api));
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw,
            never_shutdown(),
        ));

        let sent = mk_handshake("unknown.example", 1);
        client.write_all(&sent).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        handler.await.unwrap();
        assert_eq!(captured.await.unwrap(), sent);
    }

    #[tokio::test]
    async fn no_route_and_no_default_closes() {
        let table = Arc::new(RouteTable::new(false));
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw,
            never_shutdown(),
        ));

        client
            .write_all(&mk_handshake("unknown.example", 1))
            .await
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn denied_player_gets_disconnect_packet() {
        let dialed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap().to_string();
        {
            let dialed = dialed.clone();
            tokio::spawn(async move {
                if listener.accept().await.is_ok() {
                    dialed.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }

        let table = Arc::new(RouteTable::new(false));
        table.set("mc.example.com", Route::new(backend_addr, RouteSource::Api));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime();
        rt.filters = Arc::new(
            Filters::from_lists(&[], &[], &[], &["Eve".to_string()]).unwrap(),
        );
        let gw = gateway(
            table,
            None,
            Some(notifier.clone() as Arc<dyn ConnectionNotifier>),
            rt,
        );

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw,
            never_shutdown(),
        ));

        let mut sent = mk_handshake("mc.example.com", 2);
        sent.extend(mk_login("Eve"));
        client.write_all(&sent).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        handler.await.unwrap();

        assert_eq!(reply, protocol::disconnect_packet("not allowed"));
        assert!(!dialed.load(std::sync::atomic::Ordering::SeqCst));

        // Webhook observed the rejection.
        tokio::task::yield_now().await;
        let events = notifier.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let (kind, event) = &events[0];
        assert_eq!(*kind, "disconnected");
        assert_eq!(event.player.as_deref(), Some("Eve"));
        assert_eq!(event.reason, Some("filtered"));
    }

    #[tokio::test]
    async fn legacy_ping_closes_without_counters() {
        let table = Arc::new(RouteTable::new(false));
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw.clone(),
            never_shutdown(),
        ));

        client.write_all(&[0xFE, 0x01]).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        handler.await.unwrap();
        assert!(gw.sessions.snapshot().is_empty());
    }

    #[tokio::test]
    async fn malformed_framing_closes_without_dial() {
        let table = Arc::new(RouteTable::new(false));
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw,
            never_shutdown(),
        ));

        client
            .write_all(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01])
            .await
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn proxy_protocol_header_prefixes_replay() {
        let (backend_addr, captured) = capture_backend().await;
        let table = Arc::new(RouteTable::new(false));
        let mut route = Route::new(backend_addr, RouteSource::Api);
        route.proxy_protocol = ProxyProtocol::V1;
        table.set("mc.example.com", route);
        let gw = gateway(table, None, None, runtime());

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw,
            never_shutdown(),
        ));

        let sent = mk_handshake("mc.example.com", 1);
        client.write_all(&sent).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        handler.await.unwrap();

        let captured = captured.await.unwrap();
        let text = String::from_utf8_lossy(&captured);
        assert!(text.starts_with("PROXY TCP4 "), "{text}");
        let header_end = captured
            .windows(2)
            .position(|w| w == b"\r\n")
            .expect("header terminator")
            + 2;
        assert_eq!(&captured[header_end..], sent.as_slice());
    }

    #[tokio::test]
    async fn sleeping_backend_woken_then_spliced() {
        struct BindingWaker {
            addr: String,
            wakes: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl Waker for BindingWaker {
            async fn wake(&self, _waker_id: &str) -> anyhow::Result<()> {
                self.wakes
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let listener = tokio::net::TcpListener::bind(&self.addr).await?;
                tokio::spawn(async move {
                    let Ok((mut sock, _)) = listener.accept().await else {
                        return;
                    };
                    let mut buf = Vec::new();
                    let _ = sock.read_to_end(&mut buf).await;
                });
                Ok(())
            }

            async fn sleep(&self, _waker_id: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        // Reserve a port, then leave it unbound until the waker fires.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = placeholder.local_addr().unwrap().to_string();
        drop(placeholder);

        let waker = Arc::new(BindingWaker {
            addr: backend_addr.clone(),
            wakes: std::sync::atomic::AtomicUsize::new(0),
        });

        let table = Arc::new(RouteTable::new(false));
        let mut route = Route::new(backend_addr, RouteSource::Api);
        route.waker = Some("mc-example".to_string());
        table.set("mc.example.com", route);
        let gw = gateway(
            table,
            Some(waker.clone() as Arc<dyn Waker>),
            None,
            runtime(),
        );

        let (mut client, server_side, peer) = socket_pair().await;
        let handler = tokio::spawn(handle_connection(
            server_side,
            peer,
            gw.clone(),
            never_shutdown(),
        ));

        client
            .write_all(&mk_handshake("mc.example.com", 1))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        handler.await.unwrap();

        assert_eq!(waker.wakes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(gw.scaler.active_count("mc-example"), 0);
    }
}

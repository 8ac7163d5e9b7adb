use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{broadcast, watch, RwLock, Semaphore},
    task::JoinSet,
};

use crate::lodestone::{
    admin, config,
    config::{Config, RoutesFile},
    filter::Filters,
    limiter::ConnectionLimiter,
    logging, net,
    notify::{ConnectionNotifier, WebhookNotifier, WebhookWaker},
    proxy,
    proxy::{Gateway, GatewayRuntime},
    router::{Route, RouteEvent, RouteSource, RouteTable},
    scaler::{DownScaler, WakeGate, Waker},
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep the log worker alive

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        listen_addr = %cfg.listen_addr,
        admin_addr = %cfg.admin_addr,
        routes = cfg.mappings.len() + cfg.routes.len(),
        "lodestone: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let sessions: telemetry::SharedSessions = Arc::new(telemetry::SessionRegistry::new());

    let waker: Option<Arc<dyn Waker>> = match &cfg.autoscale.waker_url {
        Some(url) => Some(Arc::new(WebhookWaker::new(url.clone())?)),
        None => None,
    };
    let notifier: Option<Arc<dyn ConnectionNotifier>> = match &cfg.webhook_url {
        Some(url) => Some(Arc::new(WebhookNotifier::new(url.clone())?)),
        None => None,
    };

    // Routing stack, seeded from the config and the optional routes file.
    let table = Arc::new(RouteTable::new(cfg.simplify_srv));
    let routes_file = load_routes_file_logged(cfg.routes_file.as_deref());
    let (entries, default) = config_route_slice(&cfg, routes_file.as_ref());
    table.replace_source(RouteSource::Config, entries, default);

    let scaler = DownScaler::new(
        waker.clone(),
        cfg.autoscale.down_after,
        cfg.autoscale.allow_down,
    );
    let limiter = Arc::new(ConnectionLimiter::new(
        cfg.rate_limit.burst,
        cfg.rate_limit.per_second,
    ));
    let permits = Arc::new(Semaphore::new(cfg.rate_limit.max_connections));

    let runtime = Arc::new(RwLock::new(gateway_runtime(&cfg)?));

    let gateway = Arc::new(Gateway {
        table: table.clone(),
        scaler: scaler.clone(),
        wake_gate: WakeGate::new(),
        waker,
        notifier,
        limiter: limiter.clone(),
        permits,
        sessions: sessions.clone(),
        runtime: runtime.clone(),
    });

    let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // Route removals cancel pending scale-downs; the publisher is
    // authoritative about its backends.
    {
        let mut events = table.subscribe();
        let scaler = scaler.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(RouteEvent::Removed { waker: Some(waker_id), .. }) => {
                            scaler.on_route_removed(&waker_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "route events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            Ok(())
        });
    }

    // Rate-limiter bucket sweep keeps per-IP state bounded.
    {
        let limiter = limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        limiter.prune(Duration::from_secs(600));
                    }
                }
            }
            Ok(())
        });
    }

    // Config reload loop (polling + admin-triggered).
    {
        let config_path = resolved.path.clone();
        let table = table.clone();
        let runtime = runtime.clone();
        let reload_rx = reload_rx.clone();
        let shutdown = shutdown_rx.clone();
        let routes_file_path = cfg.routes_file.clone();
        let enabled = cfg.reload.enabled;
        let poll = cfg.reload.poll_interval;
        tasks.spawn(async move {
            reload_loop(
                config_path,
                routes_file_path,
                table,
                runtime,
                reload_rx,
                shutdown,
                enabled,
                poll,
            )
            .await;
            Ok(())
        });
    }

    // Management API.
    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr).to_string();
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            table: table.clone(),
            sessions: sessions.clone(),
            prom: prom.clone(),
            reload_tx: reload_tx.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Game listener.
    {
        let listen_addr = cfg.listen_addr.clone();
        let gateway = gateway.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { proxy::serve(&listen_addr, gateway, shutdown).await });
    }

    // Wait for a signal or for a task to die unexpectedly.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Pending stop timers must not fire during teardown.
    scaler.shutdown();

    // Give in-flight handlers a bounded window to finish: once every
    // connection permit is back, nothing is still splicing. Whatever holds
    // out past the window is force-closed when the process exits.
    let drain_timeout = Duration::from_secs(5);
    let all_permits = cfg.rate_limit.max_connections as u32;
    if tokio::time::timeout(drain_timeout, gateway.permits.acquire_many(all_permits))
        .await
        .is_err()
    {
        tracing::warn!("shutdown: drain window elapsed, closing remaining connections");
    }

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("lodestone: stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn gateway_runtime(cfg: &Config) -> anyhow::Result<GatewayRuntime> {
    let filters = Filters::from_lists(
        &cfg.filters.allowed_ips,
        &cfg.filters.denied_ips,
        &cfg.filters.allowed_players,
        &cfg.filters.denied_players,
    )
    .context("config: parse filter ip lists")?;

    Ok(GatewayRuntime {
        sniff_timeout: cfg.timeouts.sniff_timeout,
        dial_timeout: cfg.timeouts.dial_timeout,
        wake_timeout: cfg.timeouts.wake_timeout,
        idle_timeout: cfg.timeouts.idle_timeout,
        max_lifetime: cfg.timeouts.max_lifetime,
        filters: Arc::new(filters),
        reject_message: cfg.filters.reject_message.clone(),
    })
}

/// Inline mappings, rich route entries, and the watched routes file all land
/// in one config-owned slice so a reload swaps them in a single step.
fn config_route_slice(
    cfg: &Config,
    routes_file: Option<&RoutesFile>,
) -> (Vec<(String, Route)>, Option<Route>) {
    let mut entries = Vec::new();
    for (host, backend) in &cfg.mappings {
        entries.push((
            host.clone(),
            Route::new(backend.clone(), RouteSource::Config),
        ));
    }
    for r in &cfg.routes {
        let mut route = Route::new(r.backend.clone(), RouteSource::Config);
        route.waker = r.waker.clone();
        route.proxy_protocol = r.proxy_protocol;
        entries.push((r.host.clone(), route));
    }
    if let Some(rf) = routes_file {
        for (host, backend) in &rf.mappings {
            entries.push((
                host.clone(),
                Route::new(backend.clone(), RouteSource::Config),
            ));
        }
    }

    let default = routes_file
        .and_then(|rf| rf.default_server.clone())
        .or_else(|| cfg.default_server.clone())
        .map(|backend| Route::new(backend, RouteSource::Config));

    (entries, default)
}

fn load_routes_file_logged(path: Option<&std::path::Path>) -> Option<RoutesFile> {
    let path = path?;
    match config::load_routes_file(path) {
        Ok(rf) => Some(rf),
        Err(err) => {
            tracing::warn!(path = %path.display(), err = %err, "routes file load failed");
            None
        }
    }
}

async fn reload_loop(
    config_path: PathBuf,
    mut routes_file_path: Option<PathBuf>,
    table: Arc<RouteTable>,
    runtime: Arc<RwLock<GatewayRuntime>>,
    mut reload_rx: watch::Receiver<telemetry::ReloadSignal>,
    mut shutdown: watch::Receiver<bool>,
    mut enabled: bool,
    mut poll_interval: Duration,
) {
    let mut last_sig = files_sig(&config_path, routes_file_path.as_deref());

    loop {
        let sleep_dur = if enabled {
            poll_interval.max(Duration::from_millis(200))
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = reload_rx.changed() => {
                apply_reload(
                    &config_path,
                    &mut routes_file_path,
                    &table,
                    &runtime,
                    &mut enabled,
                    &mut poll_interval,
                )
                .await;
                last_sig = files_sig(&config_path, routes_file_path.as_deref());
            }
            _ = tokio::time::sleep(sleep_dur) => {
                if !enabled {
                    continue;
                }
                let sig = files_sig(&config_path, routes_file_path.as_deref());
                if sig == last_sig {
                    continue;
                }
                apply_reload(
                    &config_path,
                    &mut routes_file_path,
                    &table,
                    &runtime,
                    &mut enabled,
                    &mut poll_interval,
                )
                .await;
                last_sig = files_sig(&config_path, routes_file_path.as_deref());
            }
        }
    }
}

async fn apply_reload(
    config_path: &PathBuf,
    routes_file_path: &mut Option<PathBuf>,
    table: &Arc<RouteTable>,
    runtime: &Arc<RwLock<GatewayRuntime>>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let cfg = match config::load_config(config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), err = %err, "reload: config load failed");
            return;
        }
    };

    let next_runtime = match gateway_runtime(&cfg) {
        Ok(rt) => rt,
        Err(err) => {
            tracing::warn!(err = %err, "reload: rebuild filters failed");
            return;
        }
    };

    *routes_file_path = cfg.routes_file.clone();
    let routes_file = load_routes_file_logged(routes_file_path.as_deref());

    table.set_simplify_srv(cfg.simplify_srv);
    let (entries, default) = config_route_slice(&cfg, routes_file.as_ref());
    table.replace_source(RouteSource::Config, entries, default);

    *runtime.write().await = next_runtime;

    *enabled = cfg.reload.enabled;
    *poll_interval = cfg.reload.poll_interval;

    tracing::info!("reload: applied");
}

/// Cheap change signature: (mtime ms, length) per watched file.
fn files_sig(config_path: &std::path::Path, routes_file: Option<&std::path::Path>) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(2);
    out.push(file_sig(config_path).unwrap_or((0, 0)));
    if let Some(p) = routes_file {
        out.push(file_sig(p).unwrap_or((0, 0)));
    }
    out
}

fn file_sig(path: &std::path::Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}

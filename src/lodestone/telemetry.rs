use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns the
/// handle used to render the exposition format. Call once per process.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub host: String,
    pub backend: String,
    pub player: Option<String>,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

pub fn inc_active() {
    gauge!("lodestone_active_connections").increment(1.0);
}

pub fn dec_active() {
    gauge!("lodestone_active_connections").decrement(1.0);
}

pub fn record_accepted() {
    counter!("lodestone_connections_total").increment(1);
}

pub fn record_rate_limited() {
    counter!("lodestone_rate_limited_total").increment(1);
}

pub fn record_legacy_ping() {
    counter!("lodestone_legacy_pings_total").increment(1);
}

pub fn record_route_hit(host: &str) {
    counter!("lodestone_route_hits_total", "host" => host.to_string()).increment(1);
}

/// Connection failures, labeled by error kind and, when the sniff got far
/// enough to learn it, the normalized hostname.
pub fn record_error(kind: &'static str, host: Option<&str>) {
    counter!(
        "lodestone_connection_errors_total",
        "kind" => kind,
        "host" => host.unwrap_or("").to_string()
    )
    .increment(1);
}

pub fn record_bytes(to_backend: u64, to_client: u64) {
    counter!("lodestone_bytes_total", "direction" => "to_backend").increment(to_backend);
    counter!("lodestone_bytes_total", "direction" => "to_client").increment(to_client);
}

pub fn record_wake(result: &'static str) {
    counter!("lodestone_wakes_total", "result" => result).increment(1);
}

pub fn record_scale_down() {
    counter!("lodestone_scale_downs_total").increment(1);
}

/// Monotonic counter bumped by the admin API to request a config reload.
#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

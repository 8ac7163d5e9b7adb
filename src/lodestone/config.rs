use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::lodestone::router::ProxyProtocol;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps LODESTONE_CONFIG into the flag when unset, but keep the
    // precedence explicit for callers that bypass the CLI.
    if let Some(p) = std::env::var_os("LODESTONE_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["lodestone.toml", "lodestone.yaml", "lodestone.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no lodestone.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj =
        ProjectDirs::from("dev", "lodestone", "lodestone").context("config: resolve config dir")?;
    Ok(proj.config_dir().join("lodestone.toml"))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Empty disables the management API.
    pub admin_addr: String,
    pub default_server: Option<String>,
    /// Simple hostname → backend pairs.
    pub mappings: BTreeMap<String, String>,
    /// Rich route entries (waker binding, PROXY protocol).
    pub routes: Vec<RouteEntry>,
    /// JSON routes file watched by the reload loop.
    pub routes_file: Option<PathBuf>,
    pub simplify_srv: bool,
    pub timeouts: Timeouts,
    pub rate_limit: RateLimitConfig,
    pub filters: FilterConfig,
    pub autoscale: AutoscaleConfig,
    /// Connection lifecycle webhook.
    pub webhook_url: Option<String>,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub host: String,
    pub backend: String,
    pub waker: Option<String>,
    pub proxy_protocol: ProxyProtocol,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub sniff_timeout: Duration,
    pub dial_timeout: Duration,
    pub wake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst: u32,
    /// Zero disables per-IP limiting.
    pub per_second: f64,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub allowed_ips: Vec<String>,
    pub denied_ips: Vec<String>,
    pub allowed_players: Vec<String>,
    pub denied_players: Vec<String>,
    pub reject_message: String,
}

#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Scale idle backends to zero after `down_after`.
    pub allow_down: bool,
    pub down_after: Duration,
    /// Wake/sleep webhook; unset disables waking entirely.
    pub waker_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    admin_addr: String,

    default_server: Option<String>,

    #[serde(default)]
    mappings: BTreeMap<String, String>,

    #[serde(default)]
    routes: Vec<FileRoute>,

    routes_file: Option<PathBuf>,

    #[serde(default)]
    simplify_srv: bool,

    timeouts: Option<FileTimeouts>,

    rate_limit: Option<FileRateLimit>,

    filters: Option<FileFilters>,

    autoscale: Option<FileAutoscale>,

    webhook: Option<FileWebhook>,

    logging: Option<FileLogging>,

    reload: Option<FileReload>,
}

#[derive(Debug, Deserialize)]
struct FileRoute {
    host: String,
    backend: String,
    waker: Option<String>,
    #[serde(default)]
    proxy_protocol: ProxyProtocol,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    sniff_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    wake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    max_lifetime_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileRateLimit {
    burst: Option<u32>,
    per_second: Option<f64>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileFilters {
    #[serde(default)]
    allowed_ips: Vec<String>,
    #[serde(default)]
    denied_ips: Vec<String>,
    #[serde(default)]
    allowed_players: Vec<String>,
    #[serde(default)]
    denied_players: Vec<String>,
    reject_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileAutoscale {
    #[serde(default)]
    allow_down: bool,
    /// humantime form, e.g. "10m".
    down_after: Option<String>,
    waker_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileWebhook {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    enabled: Option<bool>,
    poll_interval_ms: Option<i64>,
}

fn ms(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(n) if n >= 0 => Duration::from_millis(n as u64),
        Some(_) => Duration::from_millis(default_ms),
        None => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let listen_addr = if fc.listen_addr.trim().is_empty() {
            ":25565".to_string()
        } else {
            fc.listen_addr.trim().to_string()
        };

        let mut routes = Vec::with_capacity(fc.routes.len());
        for (i, r) in fc.routes.into_iter().enumerate() {
            let host = r.host.trim().to_string();
            let backend = r.backend.trim().to_string();
            if host.is_empty() {
                anyhow::bail!("config: routes[{i}] missing host");
            }
            if backend.is_empty() {
                anyhow::bail!("config: routes[{i}] missing backend");
            }
            routes.push(RouteEntry {
                host,
                backend,
                waker: r.waker.map(|w| w.trim().to_string()).filter(|w| !w.is_empty()),
                proxy_protocol: r.proxy_protocol,
            });
        }

        let timeouts = {
            let t = fc.timeouts.as_ref();
            Timeouts {
                sniff_timeout: ms(t.and_then(|t| t.sniff_timeout_ms), 3000),
                dial_timeout: ms(t.and_then(|t| t.dial_timeout_ms), 5000),
                wake_timeout: ms(t.and_then(|t| t.wake_timeout_ms), 120_000),
                idle_timeout: ms(t.and_then(|t| t.idle_timeout_ms), 0),
                max_lifetime: ms(t.and_then(|t| t.max_lifetime_ms), 0),
            }
        };

        let rate_limit = {
            let r = fc.rate_limit.as_ref();
            RateLimitConfig {
                burst: r.and_then(|r| r.burst).unwrap_or(10).max(1),
                per_second: r.and_then(|r| r.per_second).unwrap_or(5.0).max(0.0),
                max_connections: r
                    .and_then(|r| r.max_connections)
                    .unwrap_or(10_000)
                    .clamp(1, 1_000_000),
            }
        };

        let filters = match fc.filters {
            Some(f) => FilterConfig {
                allowed_ips: f.allowed_ips,
                denied_ips: f.denied_ips,
                allowed_players: f.allowed_players,
                denied_players: f.denied_players,
                reject_message: f
                    .reject_message
                    .unwrap_or_else(|| "You are not allowed to join this server".to_string()),
            },
            None => FilterConfig {
                reject_message: "You are not allowed to join this server".to_string(),
                ..FilterConfig::default()
            },
        };

        let autoscale = match fc.autoscale {
            Some(a) => {
                let down_after = match a.down_after.as_deref().map(str::trim) {
                    Some(s) if !s.is_empty() => humantime::parse_duration(s)
                        .context("config: autoscale.down_after")?,
                    _ => Duration::from_secs(600),
                };
                AutoscaleConfig {
                    allow_down: a.allow_down,
                    down_after,
                    waker_url: a.waker_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()),
                }
            }
            None => AutoscaleConfig {
                allow_down: false,
                down_after: Duration::from_secs(600),
                waker_url: None,
            },
        };

        let logging = {
            let l = fc.logging.as_ref();
            let pick = |v: Option<&String>, d: &str| -> String {
                v.map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| d.to_string())
            };
            LoggingConfig {
                level: pick(l.and_then(|l| l.level.as_ref()), "info"),
                format: pick(l.and_then(|l| l.format.as_ref()), "text"),
                output: pick(l.and_then(|l| l.output.as_ref()), "stderr"),
                add_source: l.map(|l| l.add_source).unwrap_or(false),
            }
        };

        let reload = {
            let r = fc.reload.as_ref();
            ReloadConfig {
                enabled: r.and_then(|r| r.enabled).unwrap_or(true),
                poll_interval: ms(r.and_then(|r| r.poll_interval_ms), 1000),
            }
        };

        Ok(Config {
            listen_addr,
            admin_addr: fc.admin_addr.trim().to_string(),
            default_server: fc
                .default_server
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            mappings: fc.mappings,
            routes,
            routes_file: fc.routes_file,
            simplify_srv: fc.simplify_srv,
            timeouts,
            rate_limit,
            filters,
            autoscale,
            webhook_url: fc
                .webhook
                .and_then(|w| w.url)
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            logging,
            reload,
        })
    }
}

/// The watched routes file: `{"defaultServer": ..., "mappings": {...}}`.
/// Reloads replace the whole file-sourced slice of the route table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutesFile {
    #[serde(default)]
    pub default_server: Option<String>,
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

pub fn load_routes_file(path: &Path) -> anyhow::Result<RoutesFile> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse routes file {}", path.display()))
}

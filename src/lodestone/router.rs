use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// SRV lookups resolve `_minecraft._tcp.<name>`; some resolvers hand the
/// whole owner name to the client.
const SRV_PREFIX: &str = "_minecraft._tcp.";

/// Canonicalize a requested hostname before it is used as a lookup key.
///
/// The chain runs, in order: truncate at the first NUL (Forge mod-list
/// suffix), at the first backslash (infinity-filter suffix), and at a
/// TCPShield `///` marker; strip trailing dots and surrounding whitespace;
/// lowercase ASCII; then (when `simplify_srv` is set) strip leading
/// `_minecraft._tcp.` labels. Truncations run before the trailing strip, and
/// the SRV strip runs after lowercasing, so that the chain is a fixpoint:
/// `normalize(normalize(x)) == normalize(x)` for every input.
pub fn normalize_hostname(raw: &str, simplify_srv: bool) -> String {
    let mut s = raw;
    if let Some(i) = s.find('\0') {
        s = &s[..i];
    }
    if let Some(i) = s.find('\\') {
        s = &s[..i];
    }
    if let Some(i) = s.find("///") {
        s = &s[..i];
    }
    let s = s
        .trim_start_matches(char::is_whitespace)
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace());

    let mut out = s.to_ascii_lowercase();
    if simplify_srv {
        loop {
            let t = out.trim_start();
            match t.strip_prefix(SRV_PREFIX) {
                Some(rest) => out = rest.to_string(),
                None => {
                    if t.len() != out.len() {
                        out = t.to_string();
                    }
                    break;
                }
            }
        }
    }
    out
}

/// Which publisher owns a route. Reloading a publisher's slice replaces only
/// the entries it owns; entries from other publishers survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Config,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    None,
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `host:port` of the backend server.
    pub backend: String,
    /// Opaque token handed to the waker/sleeper callbacks. Routes without
    /// one are never woken or scaled down.
    pub waker: Option<String>,
    pub proxy_protocol: ProxyProtocol,
    pub source: RouteSource,
}

impl Route {
    pub fn new(backend: impl Into<String>, source: RouteSource) -> Self {
        Self {
            backend: backend.into(),
            waker: None,
            proxy_protocol: ProxyProtocol::None,
            source,
        }
    }
}

/// A successful lookup. `matched_key` is `None` when the default slot won.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub route: Route,
    pub matched_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RouteEvent {
    Set { hostname: String, backend: String },
    Removed { hostname: String, waker: Option<String> },
    DefaultSet { backend: String },
    DefaultCleared,
}

#[derive(Debug, Clone, Default)]
struct Routes {
    by_host: HashMap<String, Route>,
    default: Option<Route>,
}

/// Serializable view for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct RoutesSnapshot {
    pub mappings: std::collections::BTreeMap<String, String>,
    pub default: Option<String>,
}

/// Hostname → backend mapping with a distinguished default slot.
///
/// Reads take a lock-free snapshot; writers serialize on a mutex and publish
/// a full replacement map, so any lookup observes either the complete
/// pre-state or the complete post-state of a mutation. Change events are
/// emitted after the write lock is released.
pub struct RouteTable {
    inner: ArcSwap<Routes>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RouteEvent>,
    simplify_srv: AtomicBool,
}

impl RouteTable {
    pub fn new(simplify_srv: bool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: ArcSwap::from_pointee(Routes::default()),
            write_lock: Mutex::new(()),
            events,
            simplify_srv: AtomicBool::new(simplify_srv),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    pub fn set_simplify_srv(&self, enabled: bool) {
        self.simplify_srv.store(enabled, Ordering::Relaxed);
    }

    /// Canonicalize a hostname with this table's settings.
    pub fn normalize(&self, raw: &str) -> String {
        normalize_hostname(raw, self.simplify_srv.load(Ordering::Relaxed))
    }

    /// Exact match on the normalized key, falling back to the default slot.
    /// Returns the normalized key alongside the result so callers can label
    /// logs and metrics consistently even on a miss.
    pub fn lookup(&self, raw_host: &str) -> (String, Option<Resolved>) {
        let key = self.normalize(raw_host);
        let routes = self.inner.load();
        if let Some(route) = routes.by_host.get(&key) {
            let resolved = Resolved {
                route: route.clone(),
                matched_key: Some(key.clone()),
            };
            return (key, Some(resolved));
        }
        let resolved = routes.default.as_ref().map(|route| Resolved {
            route: route.clone(),
            matched_key: None,
        });
        (key, resolved)
    }

    /// Upsert one route. Last writer wins on the same key regardless of
    /// source.
    pub fn set(&self, hostname: &str, route: Route) {
        let key = self.normalize(hostname);
        let backend = route.backend.clone();
        {
            let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.inner.load()).clone();
            next.by_host.insert(key.clone(), route);
            self.inner.store(Arc::new(next));
            drop(guard);
        }
        let _ = self.events.send(RouteEvent::Set {
            hostname: key,
            backend,
        });
    }

    /// Remove one route. Existing connections to its backend are unaffected.
    pub fn delete(&self, hostname: &str) -> bool {
        let key = self.normalize(hostname);
        let removed;
        {
            let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.inner.load()).clone();
            removed = next.by_host.remove(&key);
            if removed.is_some() {
                self.inner.store(Arc::new(next));
            }
            drop(guard);
        }
        match removed {
            Some(route) => {
                let _ = self.events.send(RouteEvent::Removed {
                    hostname: key,
                    waker: route.waker,
                });
                true
            }
            None => false,
        }
    }

    pub fn set_default(&self, route: Route) {
        let backend = route.backend.clone();
        {
            let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.inner.load()).clone();
            next.default = Some(route);
            self.inner.store(Arc::new(next));
            drop(guard);
        }
        let _ = self.events.send(RouteEvent::DefaultSet { backend });
    }

    pub fn clear_default(&self) {
        let had_default;
        {
            let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**self.inner.load()).clone();
            had_default = next.default.take().is_some();
            if had_default {
                self.inner.store(Arc::new(next));
            }
            drop(guard);
        }
        if had_default {
            let _ = self.events.send(RouteEvent::DefaultCleared);
        }
    }

    /// Replace every route owned by `source` (and the default slot, when the
    /// new slice carries one) in a single atomic swap. Used by the config
    /// file loader so a reload cannot be observed half-applied.
    pub fn replace_source(
        &self,
        source: RouteSource,
        mappings: impl IntoIterator<Item = (String, Route)>,
        default: Option<Route>,
    ) {
        let mut events = Vec::new();
        {
            let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let cur = self.inner.load();
            let mut next = Routes {
                by_host: HashMap::with_capacity(cur.by_host.len()),
                default: cur.default.clone(),
            };
            for (k, v) in cur.by_host.iter() {
                if v.source != source {
                    next.by_host.insert(k.clone(), v.clone());
                }
            }
            for (hostname, mut route) in mappings {
                route.source = source;
                let key = self.normalize(&hostname);
                if cur.by_host.get(&key) != Some(&route) {
                    events.push(RouteEvent::Set {
                        hostname: key.clone(),
                        backend: route.backend.clone(),
                    });
                }
                next.by_host.insert(key, route);
            }
            for (k, v) in cur.by_host.iter() {
                if v.source == source && !next.by_host.contains_key(k) {
                    events.push(RouteEvent::Removed {
                        hostname: k.clone(),
                        waker: v.waker.clone(),
                    });
                }
            }
            if let Some(mut d) = default {
                d.source = source;
                if next.default.as_ref() != Some(&d) {
                    events.push(RouteEvent::DefaultSet {
                        backend: d.backend.clone(),
                    });
                }
                next.default = Some(d);
            } else if cur.default.as_ref().is_some_and(|d| d.source == source) {
                next.default = None;
                events.push(RouteEvent::DefaultCleared);
            }
            self.inner.store(Arc::new(next));
            drop(guard);
        }
        for ev in events {
            let _ = self.events.send(ev);
        }
    }

    /// Consistent immutable view for the management API.
    pub fn snapshot(&self) -> RoutesSnapshot {
        let routes = self.inner.load();
        RoutesSnapshot {
            mappings: routes
                .by_host
                .iter()
                .map(|(k, v)| (k.clone(), v.backend.clone()))
                .collect(),
            default: routes.default.as_ref().map(|d| d.backend.clone()),
        }
    }
}

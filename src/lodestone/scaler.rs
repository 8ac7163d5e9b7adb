use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::watch, task::JoinHandle, time};

use crate::lodestone::telemetry;

/// External scale-to-zero collaborator. `wake` must eventually make the
/// backend bound to `waker_id` dialable; `sleep` releases it again.
#[async_trait]
pub trait Waker: Send + Sync {
    async fn wake(&self, waker_id: &str) -> anyhow::Result<()>;
    async fn sleep(&self, waker_id: &str) -> anyhow::Result<()>;
}

struct BackendState {
    active: u64,
    /// Generation of the last mutation. A stop timer only fires if the
    /// generation it was armed under is still current, which makes
    /// cancel-on-reconnect atomic with the counter increment.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct ScalerInner {
    backends: Mutex<HashMap<String, BackendState>>,
    generations: AtomicU64,
    waker: Option<Arc<dyn Waker>>,
    idle_grace: Duration,
    enabled: bool,
}

/// Per-backend active-connection accounting, keyed by waker-id (several
/// hostnames may share one backend). When a counter stays at zero for the
/// idle grace period, the bound sleeper is invoked once.
#[derive(Clone)]
pub struct DownScaler {
    inner: Arc<ScalerInner>,
}

impl DownScaler {
    pub fn new(waker: Option<Arc<dyn Waker>>, idle_grace: Duration, enabled: bool) -> Self {
        Self {
            inner: Arc::new(ScalerInner {
                backends: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
                waker,
                idle_grace,
                enabled,
            }),
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    pub fn active_count(&self, key: &str) -> u64 {
        let map = self.lock();
        map.get(key).map(|st| st.active).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackendState>> {
        self.inner
            .backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// A connection to this backend entered splice. Cancels any pending stop
    /// timer in the same critical section as the increment.
    pub fn on_connected(&self, key: &str) {
        let generation = self.next_generation();
        let mut map = self.lock();
        let st = map.entry(key.to_string()).or_insert(BackendState {
            active: 0,
            generation,
            timer: None,
        });
        if let Some(timer) = st.timer.take() {
            timer.abort();
        }
        st.generation = generation;
        st.active += 1;
    }

    /// A connection to this backend finished. When the counter reaches zero
    /// and the backend is wakeable, arm a one-shot stop timer.
    pub fn on_disconnected(&self, key: &str, wakeable: bool) {
        let generation = self.next_generation();
        let mut map = self.lock();
        let Some(st) = map.get_mut(key) else {
            telemetry::record_error("internal", None);
            tracing::error!(backend = %key, "scaler: disconnect for untracked backend");
            return;
        };
        if st.active == 0 {
            telemetry::record_error("internal", None);
            tracing::error!(backend = %key, "scaler: counter underflow");
            return;
        }
        st.active -= 1;
        st.generation = generation;
        if st.active > 0 {
            return;
        }

        let can_sleep = wakeable && self.inner.enabled && self.inner.waker.is_some();
        if !can_sleep {
            map.remove(key);
            return;
        }

        let inner = self.inner.clone();
        let key = key.to_string();
        st.timer = Some(tokio::spawn(async move {
            time::sleep(inner.idle_grace).await;
            let fire = {
                let mut map = inner.backends.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&key) {
                    Some(st) if st.generation == generation && st.active == 0 => {
                        map.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if !fire {
                return;
            }
            let Some(waker) = &inner.waker else { return };
            telemetry::record_scale_down();
            tracing::info!(backend = %key, "scaler: idle grace elapsed, stopping backend");
            if let Err(err) = waker.sleep(&key).await {
                tracing::warn!(backend = %key, err = %err, "scaler: sleep callback failed");
            }
        }));
    }

    /// The route publishing this backend went away; the publisher is
    /// authoritative, so drop any pending stop timer.
    pub fn on_route_removed(&self, key: &str) {
        let generation = self.next_generation();
        let mut map = self.lock();
        if let Some(st) = map.get_mut(key) {
            if let Some(timer) = st.timer.take() {
                timer.abort();
            }
            st.generation = generation;
            if st.active == 0 {
                map.remove(key);
            }
        }
    }

    /// Process shutdown: cancel every pending timer without firing.
    pub fn shutdown(&self) {
        let generation = self.next_generation();
        let mut map = self.lock();
        for st in map.values_mut() {
            if let Some(timer) = st.timer.take() {
                timer.abort();
            }
            st.generation = generation;
        }
    }
}

type WakeOutcome = Option<Result<(), String>>;

/// Collapses concurrent wake attempts for one backend into a single waker
/// invocation plus readiness probe; every caller observes the same outcome.
#[derive(Clone, Default)]
pub struct WakeGate {
    pending: Arc<Mutex<HashMap<String, watch::Receiver<WakeOutcome>>>>,
}

enum Claim {
    Leader(watch::Sender<WakeOutcome>),
    Follower(watch::Receiver<WakeOutcome>),
}

impl WakeGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, waker_id: &str) -> Claim {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = pending.get(waker_id) {
            // An entry whose sender died without publishing is from an
            // aborted leader; take its place.
            let stale = rx.has_changed().is_err() && rx.borrow().is_none();
            if !stale {
                return Claim::Follower(rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        pending.insert(waker_id.to_string(), rx);
        Claim::Leader(tx)
    }

    /// Make the backend behind `waker_id` dialable, waking it at most once
    /// across all concurrent callers. Bounded by `wake_timeout`.
    pub async fn ensure_awake(
        &self,
        waker: &Arc<dyn Waker>,
        waker_id: &str,
        backend: &str,
        wake_timeout: Duration,
    ) -> Result<(), String> {
        match self.claim(waker_id) {
            Claim::Follower(mut rx) => {
                let wait = async {
                    loop {
                        if let Some(outcome) = rx.borrow_and_update().clone() {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            return Err("wake attempt aborted".to_string());
                        }
                    }
                };
                match time::timeout(wake_timeout, wait).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err("timed out waiting for backend readiness".to_string()),
                }
            }
            Claim::Leader(tx) => {
                let outcome = match time::timeout(
                    wake_timeout,
                    wake_and_probe(waker, waker_id, backend),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err("backend not dialable within wake timeout".to_string()),
                };
                {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(waker_id);
                }
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }
}

/// Probe, wake, then probe on an exponential backoff until the backend
/// accepts a TCP connect. The caller bounds the overall wait.
async fn wake_and_probe(
    waker: &Arc<dyn Waker>,
    waker_id: &str,
    backend: &str,
) -> Result<(), String> {
    if probe_once(backend, Duration::from_millis(500)).await {
        return Ok(());
    }

    tracing::info!(backend = %backend, waker_id = %waker_id, "waking backend");
    waker
        .wake(waker_id)
        .await
        .map_err(|err| format!("waker callback: {err:#}"))?;

    let mut delay = Duration::from_millis(250);
    loop {
        if probe_once(backend, Duration::from_secs(1)).await {
            return Ok(());
        }
        let jitter = Duration::from_millis(rand::random::<u64>() % 100);
        time::sleep(delay + jitter).await;
        delay = (delay * 2).min(Duration::from_secs(2));
    }
}

async fn probe_once(backend: &str, connect_timeout: Duration) -> bool {
    matches!(
        time::timeout(connect_timeout, TcpStream::connect(backend)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockWaker {
        wakes: AtomicUsize,
        sleeps: AtomicUsize,
    }

    #[async_trait]
    impl Waker for MockWaker {
        async fn wake(&self, _waker_id: &str) -> anyhow::Result<()> {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn sleep(&self, _waker_id: &str) -> anyhow::Result<()> {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const GRACE: Duration = Duration::from_secs(600);

    fn scaler(waker: &Arc<MockWaker>) -> DownScaler {
        DownScaler::new(Some(waker.clone() as Arc<dyn Waker>), GRACE, true)
    }

    #[tokio::test(start_paused = true)]
    async fn counters_track_connections() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_connected("b1");
        assert_eq!(scaler.active_count("b1"), 2);
        scaler.on_disconnected("b1", true);
        assert_eq!(scaler.active_count("b1"), 1);
        scaler.on_disconnected("b1", true);
        assert_eq!(scaler.active_count("b1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_backend_stopped_once() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_disconnected("b1", true);

        time::sleep(GRACE + Duration::from_secs(1)).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 1);

        time::sleep(GRACE * 2).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cancels_pending_stop() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_disconnected("b1", true);

        time::sleep(GRACE / 2).await;
        scaler.on_connected("b1");
        time::sleep(GRACE * 2).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 0);

        scaler.on_disconnected("b1", true);
        time::sleep(GRACE + Duration::from_secs(1)).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn route_removal_cancels_timer() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_disconnected("b1", true);
        scaler.on_route_removed("b1");

        time::sleep(GRACE * 2).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_all_timers() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_disconnected("b1", true);
        scaler.on_connected("b2");
        scaler.on_disconnected("b2", true);
        scaler.shutdown();

        time::sleep(GRACE * 2).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unwakeable_backend_never_stopped() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_connected("b1");
        scaler.on_disconnected("b1", false);
        time::sleep(GRACE * 2).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn underflow_is_refused() {
        let waker = Arc::new(MockWaker::default());
        let scaler = scaler(&waker);

        scaler.on_disconnected("b1", true);
        assert_eq!(scaler.active_count("b1"), 0);
        scaler.on_connected("b1");
        scaler.on_disconnected("b1", true);
        scaler.on_disconnected("b1", true);
        assert_eq!(scaler.active_count("b1"), 0);
    }

    #[tokio::test]
    async fn wake_gate_dedupes_concurrent_callers() {
        let gate = WakeGate::new();

        // The backend starts unreachable; the mock waker "starts" it by
        // binding the listener the probe is dialing.
        let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = placeholder.local_addr().unwrap().to_string();

        struct BindingWaker {
            addr: String,
            wakes: AtomicUsize,
        }

        #[async_trait]
        impl Waker for BindingWaker {
            async fn wake(&self, _waker_id: &str) -> anyhow::Result<()> {
                self.wakes.fetch_add(1, Ordering::SeqCst);
                let listener = tokio::net::TcpListener::bind(&self.addr).await?;
                tokio::spawn(async move {
                    loop {
                        if listener.accept().await.is_err() {
                            break;
                        }
                    }
                });
                Ok(())
            }

            async fn sleep(&self, _waker_id: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        drop(placeholder);
        let binding = Arc::new(BindingWaker {
            addr: backend.clone(),
            wakes: AtomicUsize::new(0),
        });
        let dynamic: Arc<dyn Waker> = binding.clone();

        let a = gate.ensure_awake(&dynamic, "b1", &backend, Duration::from_secs(10));
        let b = gate.ensure_awake(&dynamic, "b1", &backend, Duration::from_secs(10));
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok(), "{ra:?}");
        assert!(rb.is_ok(), "{rb:?}");
        assert_eq!(binding.wakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wake_gate_reports_waker_failure() {
        struct FailingWaker;

        #[async_trait]
        impl Waker for FailingWaker {
            async fn wake(&self, _waker_id: &str) -> anyhow::Result<()> {
                anyhow::bail!("replica quota exhausted")
            }

            async fn sleep(&self, _waker_id: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let gate = WakeGate::new();
        let failing: Arc<dyn Waker> = Arc::new(FailingWaker);
        let err = gate
            .ensure_awake(&failing, "b1", "127.0.0.1:1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.contains("replica quota exhausted"), "{err}");
    }
}

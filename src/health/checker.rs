use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{notify_transition, now_millis, Callback, Checker, Prober, PredicateProber, HttpProber};
use crate::config::HealthConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::node::NodeTable;

/// Active health checker for a single service, generic over how a probe is
/// actually carried out. `HealthChecker` and `AdvancedHealthChecker` are
/// both instances of this — one HTTP-backed, one predicate-backed — rather
/// than two near-duplicate implementations of the same scheduling loop.
pub struct GenericChecker<P: Prober + 'static> {
    service_id: String,
    config: HealthConfig,
    nodes: Arc<NodeTable>,
    prober: Arc<P>,
    callbacks: Arc<RwLock<Vec<Callback>>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Prober + 'static> GenericChecker<P> {
    fn with_prober(
        service_id: impl Into<String>,
        config: HealthConfig,
        nodes: Arc<NodeTable>,
        prober: P,
        callbacks: Arc<RwLock<Vec<Callback>>>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            config,
            nodes,
            prober: Arc::new(prober),
            callbacks,
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }
}

impl GenericChecker<HttpProber> {
    /// `callbacks` is shared with whatever owns this checker (typically a
    /// [`crate::service::Service`]) so registrations made through the owner
    /// and transitions fired by this loop go through the same list.
    pub fn new(
        service_id: impl Into<String>,
        config: HealthConfig,
        nodes: Arc<NodeTable>,
        callbacks: Arc<RwLock<Vec<Callback>>>,
    ) -> Self {
        let prober = HttpProber::new(config.clone());
        Self::with_prober(service_id, config, nodes, prober, callbacks)
    }
}

impl GenericChecker<PredicateProber> {
    pub fn with_predicate(
        service_id: impl Into<String>,
        config: HealthConfig,
        nodes: Arc<NodeTable>,
        callbacks: Arc<RwLock<Vec<Callback>>>,
        predicate: impl Fn(&crate::config::NodeConfig) -> bool + Send + Sync + 'static,
    ) -> Self {
        let prober = PredicateProber::new(predicate);
        Self::with_prober(service_id, config, nodes, prober, callbacks)
    }
}

/// Independent HTTP-based checker: issues a real request per node per tick.
pub type HealthChecker = GenericChecker<HttpProber>;

/// Same scheduling loop, but health is decided by an injected predicate
/// rather than an HTTP round trip.
pub type AdvancedHealthChecker = GenericChecker<PredicateProber>;

impl<P: Prober + 'static> Checker for GenericChecker<P> {
    fn start(&self) -> GatewayResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(GatewayError::CheckerAlreadyRunning);
        }

        let service_id = self.service_id.clone();
        let config = self.config.clone();
        let nodes = self.nodes.clone();
        let prober = self.prober.clone();
        let callbacks = self.callbacks.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(run_loop(service_id, config, nodes, prober, callbacks, shutdown));
        *task = Some(handle);
        Ok(())
    }

    fn stop(&self) -> GatewayResult<()> {
        self.shutdown.notify_one();
        *self.task.lock() = None;
        Ok(())
    }

    fn register_callback(&self, callback: Callback) {
        self.callbacks.write().push(callback);
    }
}

async fn run_loop<P: Prober + 'static>(
    service_id: String,
    config: HealthConfig,
    nodes: Arc<NodeTable>,
    prober: Arc<P>,
    callbacks: Arc<RwLock<Vec<Callback>>>,
    shutdown: Arc<Notify>,
) {
    if !config.enabled || config.interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(config.interval.as_std());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                dispatch_round(&service_id, &config, &nodes, &prober, &callbacks).await;
            }
            _ = shutdown.notified() => {
                debug!(service_id = %service_id, "health checker loop stopping");
                return;
            }
        }
    }
}

async fn dispatch_round<P: Prober + 'static>(
    service_id: &str,
    config: &HealthConfig,
    nodes: &Arc<NodeTable>,
    prober: &Arc<P>,
    callbacks: &Arc<RwLock<Vec<Callback>>>,
) {
    let snapshot = nodes.all();
    let mut handles = Vec::with_capacity(snapshot.len());

    for node in snapshot {
        let prober = prober.clone();
        let timeout = config.timeout.as_std();
        handles.push(tokio::spawn(async move {
            let success = tokio::time::timeout(timeout, prober.probe(&node)).await.unwrap_or(false);
            (node.id, success)
        }));
    }

    for handle in handles {
        let Ok((node_id, success)) = handle.await else {
            continue;
        };

        let result = nodes.apply_probe_result(
            &node_id,
            success,
            now_millis(),
            config.healthy_threshold,
            config.unhealthy_threshold,
        );

        match result {
            Ok(Some(new_health)) => {
                notify_transition(callbacks, &node_id, new_health);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(service_id = %service_id, node_id = %node_id, "health probe result dropped: {e}");
            }
        }
    }
}

/// Always reports success, starts and stops instantly, and silently
/// discards registered callbacks. Selected for a service whose
/// `HealthConfig.enabled` is `false` so the rest of the stack never has to
/// special-case "no health checking" at the call site.
pub struct NoOpHealthChecker;

impl Checker for NoOpHealthChecker {
    fn start(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn stop(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn register_callback(&self, _callback: Callback) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn config_with_interval(millis: u64) -> HealthConfig {
        let mut c = HealthConfig::default();
        c.interval = crate::config::Duration::from_millis(millis);
        c.timeout = crate::config::Duration::from_millis(millis.max(5));
        c.healthy_threshold = 2;
        c.unhealthy_threshold = 2;
        c
    }

    #[tokio::test]
    async fn predicate_checker_transitions_and_fires_callback() {
        let nodes = Arc::new(NodeTable::new("svc", vec![NodeConfig::new("n1", "http://n1")]));
        let callbacks = Arc::new(RwLock::new(Vec::new()));
        let checker = GenericChecker::with_predicate("svc", config_with_interval(10), nodes.clone(), callbacks, |_n| false);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        checker.register_callback(Arc::new(move |_id: &str, healthy: bool| {
            if !healthy {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        checker.start().unwrap();
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        checker.stop().unwrap();

        assert!(!nodes.get("n1").unwrap().health);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_twice_without_stop_errors() {
        let nodes = Arc::new(NodeTable::new("svc", vec![NodeConfig::new("n1", "http://n1")]));
        let callbacks = Arc::new(RwLock::new(Vec::new()));
        let checker = GenericChecker::with_predicate("svc", config_with_interval(1000), nodes, callbacks, |_n| true);
        checker.start().unwrap();
        let err = checker.start().unwrap_err();
        assert!(matches!(err, GatewayError::CheckerAlreadyRunning));
        checker.stop().unwrap();
    }

    #[tokio::test]
    async fn noop_checker_ignores_lifecycle_and_callbacks() {
        let checker = NoOpHealthChecker;
        checker.start().unwrap();
        checker.register_callback(Arc::new(|_id: &str, _h: bool| panic!("should never run")));
        checker.stop().unwrap();
        checker.close().unwrap();
    }

    /// A minimal HTTP/1.1 responder over a raw `TcpListener`: returns 500
    /// until `flip_after` has elapsed since the listener was bound, then 200.
    /// No framework server is needed here — the prober only cares about the
    /// status line, so hand-rolling it avoids pulling in hyper's server
    /// feature for one test.
    async fn spawn_flipping_server(flip_after: StdDuration) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let started = tokio::time::Instant::now();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let healthy = started.elapsed() >= flip_after;
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    // Read whatever the client sent; a malformed or partial
                    // read is fine, we only need to unblock the write side.
                    let _ = socket.read(&mut buf).await;
                    let line = if healthy {
                        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
                    } else {
                        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"
                    };
                    let _ = socket.write_all(line.as_bytes()).await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn http_checker_flips_unhealthy_then_recovers_on_real_probes() {
        let addr = spawn_flipping_server(StdDuration::from_millis(200)).await;
        let url = format!("http://{addr}");

        let mut config = HealthConfig::default();
        config.interval = crate::config::Duration::from_millis(50);
        config.timeout = crate::config::Duration::from_millis(20);
        config.healthy_threshold = 2;
        config.unhealthy_threshold = 3;

        let nodes = Arc::new(NodeTable::new("svc", vec![NodeConfig::new("n1", url)]));
        let callbacks = Arc::new(RwLock::new(Vec::new()));
        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let transitions2 = transitions.clone();

        let checker = GenericChecker::new("svc", config, nodes.clone(), callbacks);
        checker.register_callback(Arc::new(move |_id: &str, healthy: bool| {
            transitions2.lock().unwrap().push(healthy);
        }));

        checker.start().unwrap();
        tokio::time::sleep(StdDuration::from_millis(600)).await;
        checker.stop().unwrap();

        assert!(nodes.get("n1").unwrap().health);
        let seen = transitions.lock().unwrap().clone();
        assert_eq!(seen, vec![false, true]);
    }
}

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{now_millis, HttpProber, Prober};
use crate::config::{HealthConfig, NodeConfig};
use crate::error::{GatewayError, GatewayResult};

/// `fn(service_id, node_id, healthy)` — the shared manager's callback shape
/// carries a service id because, unlike the per-service [`super::Checker`],
/// one manager instance probes every service in a [`ServiceDirectory`].
pub type SharedCallback = Arc<dyn Fn(&str, &str, bool) + Send + Sync>;

/// The read-only view of a service table the shared manager needs. Kept
/// separate from `ServiceManager` itself so this module doesn't have to
/// depend on `crate::service` (which in turn depends on this module for the
/// checker types it stores per service).
pub trait ServiceDirectory: Send + Sync {
    fn service_ids(&self) -> Vec<String>;
    fn health_config(&self, service_id: &str) -> Option<HealthConfig>;
    fn nodes(&self, service_id: &str) -> Vec<NodeConfig>;
    fn apply_probe_result(&self, service_id: &str, node_id: &str, success: bool) -> GatewayResult<Option<bool>>;
}

const DEFAULT_WORKER_POOL: usize = 100;
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Single scheduling loop, fanning out active probes across every service
/// in a [`ServiceDirectory`] instead of running one loop per service. Ticks
/// once a second; on each tick a service's nodes are only probed once
/// `(now - last_health_check) >= health_check.interval` has elapsed, so a
/// service configured for a 30s interval is still only actually probed
/// roughly every 30 ticks. Probe concurrency across the whole directory is
/// bounded by a worker pool (default 100) so a directory with many services
/// can't open unbounded outbound connections at once.
pub struct SharedHealthCheckerManager {
    directory: Arc<dyn ServiceDirectory>,
    probers: Arc<DashMap<String, Arc<HttpProber>>>,
    callbacks: Arc<RwLock<Vec<SharedCallback>>>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SharedHealthCheckerManager {
    pub fn new(directory: Arc<dyn ServiceDirectory>) -> Self {
        Self::with_worker_pool(directory, DEFAULT_WORKER_POOL)
    }

    pub fn with_worker_pool(directory: Arc<dyn ServiceDirectory>, workers: usize) -> Self {
        Self {
            directory,
            probers: Arc::new(DashMap::new()),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn register_callback(&self, callback: SharedCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn start(&self) -> GatewayResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(GatewayError::CheckerAlreadyRunning);
        }

        let directory = self.directory.clone();
        let probers = self.probers.clone();
        let callbacks = self.callbacks.clone();
        let semaphore = self.semaphore.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(run_loop(directory, probers, callbacks, semaphore, shutdown));
        *task = Some(handle);
        Ok(())
    }

    pub fn stop(&self) -> GatewayResult<()> {
        self.shutdown.notify_one();
        *self.task.lock() = None;
        Ok(())
    }

    pub fn close(&self) -> GatewayResult<()> {
        self.stop()
    }
}

async fn run_loop(
    directory: Arc<dyn ServiceDirectory>,
    probers: Arc<DashMap<String, Arc<HttpProber>>>,
    callbacks: Arc<RwLock<Vec<SharedCallback>>>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&directory, &probers, &callbacks, &semaphore).await;
            }
            _ = shutdown.notified() => {
                debug!("shared health checker manager stopping");
                return;
            }
        }
    }
}

async fn sweep(
    directory: &Arc<dyn ServiceDirectory>,
    probers: &Arc<DashMap<String, Arc<HttpProber>>>,
    callbacks: &Arc<RwLock<Vec<SharedCallback>>>,
    semaphore: &Arc<Semaphore>,
) {
    let now = now_millis();

    for service_id in directory.service_ids() {
        let Some(config) = directory.health_config(&service_id) else {
            continue;
        };
        if !config.enabled || config.interval.is_zero() {
            continue;
        }

        let interval_ms = config.interval.as_millis() as u64;
        let outer_deadline = StdDuration::from_millis(interval_ms.saturating_mul(2).max(1));

        let prober = probers
            .entry(service_id.clone())
            .or_insert_with(|| Arc::new(HttpProber::new(config.clone())))
            .clone();

        for node in directory.nodes(&service_id) {
            let due = match node.last_health_check {
                Some(last) => now.saturating_sub(last) >= interval_ms,
                None => true,
            };
            if !due {
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                continue;
            };

            let directory = directory.clone();
            let callbacks = callbacks.clone();
            let prober = prober.clone();
            let service_id = service_id.clone();
            let timeout = config.timeout.as_std();

            tokio::spawn(async move {
                let _permit = permit;
                let node_id = node.id.clone();

                let success = tokio::time::timeout(outer_deadline, async {
                    tokio::time::timeout(timeout, prober.probe(&node)).await.unwrap_or(false)
                })
                .await
                .unwrap_or(false);

                match directory.apply_probe_result(&service_id, &node_id, success) {
                    Ok(Some(new_health)) => notify_shared(&callbacks, &service_id, &node_id, new_health),
                    Ok(None) => {}
                    Err(e) => warn!(service_id = %service_id, node_id = %node_id, "health probe result dropped: {e}"),
                }
            });
        }
    }
}

fn notify_shared(callbacks: &RwLock<Vec<SharedCallback>>, service_id: &str, node_id: &str, healthy: bool) {
    let snapshot: Vec<SharedCallback> = callbacks.read().clone();
    for cb in snapshot {
        let service_id = service_id.to_string();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| cb(&service_id, &node_id, healthy)));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(service_id = %service_id, node_id = %node_id, "health transition callback panicked: {msg}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock as PlRwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDirectory {
        config: HealthConfig,
        nodes: PlRwLock<HashMap<String, Vec<NodeConfig>>>,
    }

    impl ServiceDirectory for FakeDirectory {
        fn service_ids(&self) -> Vec<String> {
            self.nodes.read().keys().cloned().collect()
        }

        fn health_config(&self, _service_id: &str) -> Option<HealthConfig> {
            Some(self.config.clone())
        }

        fn nodes(&self, service_id: &str) -> Vec<NodeConfig> {
            self.nodes.read().get(service_id).cloned().unwrap_or_default()
        }

        fn apply_probe_result(&self, service_id: &str, node_id: &str, success: bool) -> GatewayResult<Option<bool>> {
            let mut table = self.nodes.write();
            let nodes = table.get_mut(service_id).ok_or_else(|| GatewayError::ServiceNotFound(service_id.to_string()))?;
            let node = nodes
                .iter_mut()
                .find(|n| n.id == node_id)
                .ok_or_else(|| GatewayError::NodeNotFound {
                    service: service_id.to_string(),
                    node: node_id.to_string(),
                })?;
            if success {
                node.consecutive_success += 1;
                node.consecutive_failure = 0;
            } else {
                node.consecutive_failure += 1;
                node.consecutive_success = 0;
            }
            node.last_health_check = Some(now_millis());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn sweep_only_probes_due_nodes() {
        let mut config = HealthConfig::default();
        config.path = "/nope".into();
        config.interval = crate::config::Duration::from_secs(3600);
        config.timeout = crate::config::Duration::from_millis(50);

        let mut nodes = HashMap::new();
        nodes.insert(
            "svc".to_string(),
            vec![NodeConfig::new("n1", "http://127.0.0.1:1")],
        );
        let directory = Arc::new(FakeDirectory {
            config,
            nodes: PlRwLock::new(nodes),
        });

        let probers = Arc::new(DashMap::new());
        let callbacks = Arc::new(RwLock::new(Vec::new()));
        let semaphore = Arc::new(Semaphore::new(4));

        let directory_dyn: Arc<dyn ServiceDirectory> = directory.clone();
        sweep(&directory_dyn, &probers, &callbacks, &semaphore).await;
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        assert!(directory.nodes.read()["svc"][0].last_health_check.is_some());
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_and_errors_on_double_start() {
        let config = HealthConfig::default();
        let directory: Arc<dyn ServiceDirectory> = Arc::new(FakeDirectory {
            config,
            nodes: PlRwLock::new(HashMap::new()),
        });
        let manager = SharedHealthCheckerManager::new(directory);
        manager.start().unwrap();
        assert!(matches!(manager.start().unwrap_err(), GatewayError::CheckerAlreadyRunning));
        manager.stop().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        manager.register_callback(Arc::new(move |_s: &str, _n: &str, _h: bool| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}

//! A `Service` owns one balancer, one health checker (or none, in shared
//! mode), the node table backing both, and a small set of request-count and
//! response-time statistics. `ServiceManager` (in [`manager`]) is the
//! lifecycle owner that creates, replaces, and tears these down.

mod manager;

pub use manager::ServiceManager;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::RwLock;
use tracing::debug;

use crate::balancer::{Balancer, BalancerFactory, RequestContext};
use crate::config::{HealthConfig, LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};
use crate::error::{GatewayError, GatewayResult};
use crate::health::{self, Callback, Checker, HealthChecker, NoOpHealthChecker};
use crate::node::NodeTable;

/// Whether a `Service`'s health checking runs as its own independent loop
/// or is driven externally by a [`crate::health::SharedHealthCheckerManager`]
/// fanning out across every service a `ServiceManager` owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerMode {
    Independent,
    Shared,
}

/// A resolved backend service: a strategy-specific balancer over a node
/// table, plus (in independent mode) a running active-probe loop.
pub struct Service {
    id: String,
    name: String,
    strategy: Strategy,
    load_balancer: LoadBalancerConfig,
    health_check: HealthConfig,
    nodes: Arc<NodeTable>,
    balancer: Box<dyn Balancer>,
    checker: Box<dyn Checker>,
    callbacks: Arc<RwLock<Vec<Callback>>>,
    stats: RequestStats,
}

impl Service {
    pub fn new(cfg: ServiceConfig, mode: CheckerMode) -> GatewayResult<Self> {
        crate::config::validate_service(&cfg)?;

        let balancer = BalancerFactory::build(&cfg)?;
        let nodes = Arc::new(NodeTable::new(cfg.id.clone(), cfg.nodes.clone()));
        let callbacks: Arc<RwLock<Vec<Callback>>> = Arc::new(RwLock::new(Vec::new()));

        let checker: Box<dyn Checker> = if !cfg.health_check.enabled {
            Box::new(NoOpHealthChecker)
        } else {
            match mode {
                CheckerMode::Independent => Box::new(HealthChecker::new(
                    cfg.id.clone(),
                    cfg.health_check.clone(),
                    nodes.clone(),
                    callbacks.clone(),
                )),
                // The shared manager drives probing for every service from
                // one loop; this service runs no loop of its own.
                CheckerMode::Shared => Box::new(NoOpHealthChecker),
            }
        };

        if mode == CheckerMode::Independent {
            checker.start()?;
        }

        debug!(service_id = %cfg.id, strategy = %cfg.strategy, nodes = cfg.nodes.len(), "service constructed");

        Ok(Self {
            id: cfg.id,
            name: cfg.name,
            strategy: cfg.strategy,
            load_balancer: cfg.load_balancer,
            health_check: cfg.health_check,
            nodes,
            balancer,
            checker,
            callbacks,
            stats: RequestStats::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn snapshot_config(&self) -> ServiceConfig {
        ServiceConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            strategy: self.strategy,
            nodes: self.nodes.all(),
            load_balancer: self.load_balancer.clone(),
            health_check: self.health_check.clone(),
        }
    }

    pub fn select_node(&self, ctx: &RequestContext) -> GatewayResult<NodeConfig> {
        let snapshot = self.snapshot_config();
        match self.balancer.select(&snapshot, ctx) {
            Some(node) => {
                self.stats.record_selection(true);
                Ok(node)
            }
            None => {
                self.stats.record_selection(false);
                Err(GatewayError::NoAvailableNode(self.id.clone()))
            }
        }
    }

    pub fn release(&self, node_id: &str) {
        self.balancer.release(node_id);
    }

    pub fn record_response(&self, duration: StdDuration, success: bool) {
        self.stats.record_response(duration, success);
    }

    pub fn add_node(&self, node: NodeConfig) -> GatewayResult<()> {
        self.nodes.add(node)
    }

    pub fn remove_node(&self, id: &str) -> GatewayResult<NodeConfig> {
        self.nodes.remove(id)
    }

    pub fn update_node_weight(&self, id: &str, weight: u32) -> GatewayResult<()> {
        self.nodes.update_weight(id, weight)?;
        self.balancer.on_weight_changed(id);
        Ok(())
    }

    /// Administrative override of observed health, bypassing the probe
    /// hysteresis counters.
    pub fn update_node_health(&self, id: &str, healthy: bool) -> GatewayResult<()> {
        if self.nodes.update_health(id, healthy)?.is_some() {
            health::notify_transition(&self.callbacks, id, healthy);
        }
        Ok(())
    }

    pub fn update_node_status(&self, id: &str, enabled: bool) -> GatewayResult<()> {
        self.nodes.update_status(id, enabled)
    }

    /// Entry point for externally-driven (shared-manager) probe results.
    /// Applies the same hysteresis counters an independent checker would
    /// and fires this service's own registered callbacks on a transition.
    pub fn apply_probe_result(&self, node_id: &str, success: bool) -> GatewayResult<Option<bool>> {
        let result = self.nodes.apply_probe_result(
            node_id,
            success,
            health::now_millis(),
            self.health_check.healthy_threshold,
            self.health_check.unhealthy_threshold,
        )?;
        if let Some(new_health) = result {
            health::notify_transition(&self.callbacks, node_id, new_health);
        }
        Ok(result)
    }

    pub fn register_callback(&self, callback: Callback) {
        self.callbacks.write().push(callback);
    }

    pub fn healthy_nodes(&self) -> Vec<NodeConfig> {
        self.nodes.healthy()
    }

    pub fn unhealthy_nodes(&self) -> Vec<NodeConfig> {
        self.nodes.unhealthy()
    }

    pub fn all_nodes(&self) -> Vec<NodeConfig> {
        self.nodes.all()
    }

    pub fn health_config(&self) -> HealthConfig {
        self.health_check.clone()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut value = self.stats.snapshot();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert("balancer".to_string(), serde_json::to_value(self.balancer.get_stats()).unwrap_or_default());
        }
        value
    }

    /// Stops the checker and resets the balancer. Idempotent: calling this
    /// twice is harmless (`Checker::stop` and `Balancer::reset` both are).
    pub fn close(&self) -> GatewayResult<()> {
        self.checker.stop()?;
        self.balancer.reset();
        Ok(())
    }
}

/// Thin facade over `ServiceManager`: resolves a service by id and
/// delegates. Kept as its own type (rather than folded entirely into
/// `ServiceManager`) so an embedding request pipeline can depend on just
/// this narrow read path.
pub struct Selector {
    manager: Arc<ServiceManager>,
}

impl Selector {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    pub fn select_node(&self, service_id: &str, ctx: &RequestContext) -> GatewayResult<NodeConfig> {
        self.manager.select_node(service_id, ctx)
    }

    pub fn release(&self, service_id: &str, node_id: &str) -> GatewayResult<()> {
        self.manager.release(service_id, node_id)
    }
}

/// Request-count and response-time statistics for a single service, per the
/// observable metrics this core exposes alongside each balancer's own
/// `GetStats`. `min`/`max` use a CAS loop rather than a lock since they are
/// single-word comparisons on the request's hot path; `0` is the sentinel
/// for "no response recorded yet" on `min`.
#[derive(Default)]
struct RequestStats {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    response_count: AtomicU64,
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl RequestStats {
    fn record_selection(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_response(&self, duration: StdDuration, _success: bool) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        self.response_count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        cas_min(&self.min_micros, micros);
        cas_max(&self.max_micros, micros);
    }

    fn snapshot(&self) -> serde_json::Value {
        let responses = self.response_count.load(Ordering::Relaxed);
        let avg = if responses > 0 {
            self.sum_micros.load(Ordering::Relaxed) / responses
        } else {
            0
        };
        serde_json::json!({
            "requests_total": self.total.load(Ordering::Relaxed),
            "requests_success": self.success.load(Ordering::Relaxed),
            "requests_failure": self.failure.load(Ordering::Relaxed),
            "response_time_micros": {
                "min": self.min_micros.load(Ordering::Relaxed),
                "max": self.max_micros.load(Ordering::Relaxed),
                "avg": avg,
            },
        })
    }
}

fn cas_min(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    loop {
        if current != 0 && current <= value {
            return;
        }
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

fn cas_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    loop {
        if current >= value {
            return;
        }
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

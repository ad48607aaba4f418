use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::duration::Duration;

/// Top-level topology: every service this gateway instance knows how to
/// balance across, keyed by service id. This is the shape an external
/// config loader (YAML file, database row, control-plane push) is expected
/// to produce; `ServiceManager` never reads files itself beyond the
/// convenience `Config::load` used by the demo binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// A named collection of weighted nodes reachable over HTTP(S), balanced
/// according to `strategy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,

    pub name: String,

    pub strategy: Strategy,

    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub health_check: HealthConfig,
}

/// Load balancing strategies this core knows how to construct via
/// [`crate::balancer::BalancerFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    Random,
    IpHash,
    LeastConn,
    WeightedRoundRobin,
    ConsistentHash,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
            Strategy::IpHash => "ip-hash",
            Strategy::LeastConn => "least-conn",
            Strategy::WeightedRoundRobin => "weighted-round-robin",
            Strategy::ConsistentHash => "consistent-hash",
        };
        f.write_str(s)
    }
}

/// Balancer-facing knobs. `strategy` here mirrors `ServiceConfig::strategy`
/// (kept as a separate field for parity with the wire config shape) and is
/// validated to agree with it in [`Config::validate`]; the factory always
/// dispatches on `ServiceConfig::strategy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    #[serde(default)]
    pub session_affinity: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_timeout")]
    pub retry_timeout: Duration,

    #[serde(default)]
    pub health_check: HealthConfig,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            session_affinity: false,
            max_retries: default_max_retries(),
            retry_timeout: default_retry_timeout(),
            health_check: HealthConfig::default(),
        }
    }
}

fn default_strategy() -> Strategy {
    Strategy::RoundRobin
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_timeout() -> Duration {
    Duration::from_secs(1)
}

/// A single backend, identified by a stable `id`. `weight`, `enabled`,
/// `health`, and the hysteresis counters are mutated in place over the
/// node's lifetime; `id` and `url` never change after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,

    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_enabled")]
    pub health: bool,

    #[serde(default)]
    pub consecutive_success: u32,

    #[serde(default)]
    pub consecutive_failure: u32,

    /// Unix timestamp, milliseconds. `None` until the first probe completes.
    #[serde(default)]
    pub last_health_check: Option<u64>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight: 1,
            enabled: true,
            health: true,
            consecutive_success: 0,
            consecutive_failure: 0,
            last_health_check: None,
            metadata: HashMap::new(),
        }
    }

    /// A node is eligible for selection iff it is administratively enabled
    /// and observed-healthy. This is the single predicate every balancer
    /// filters on before applying its strategy.
    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.health
    }

    /// `0` weight is treated as `1` everywhere weight participates in a
    /// calculation (round-robin ignores weight entirely).
    #[inline]
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}

/// Active health-probe configuration for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_method")]
    pub method: String,

    #[serde(default = "default_health_interval")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: HashSet<u16>,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
            method: default_health_method(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            expected_status_codes: default_expected_status_codes(),
            headers: HashMap::new(),
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_method() -> String {
    "GET".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_expected_status_codes() -> HashSet<u16> {
    HashSet::from([200])
}

mod consistent_hash;
mod ip_hash;
mod least_conn;
mod random;
mod round_robin;
mod weighted_round_robin;

pub use consistent_hash::ConsistentHashBalancer;
pub use ip_hash::IpHashBalancer;
pub use least_conn::LeastConnBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted_round_robin::WeightedRoundRobinBalancer;

use std::collections::HashMap;

use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};
use crate::error::{GatewayError, GatewayResult};

/// The only request-derived data a balancer is allowed to read, per the
/// core's scope boundary: it never sees proxying concerns like the request
/// body or full URL.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub remote_address: String,
    pub headers: HashMap<String, String>,
    pub url_path: String,
}

impl RequestContext {
    pub fn new(remote_address: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            headers: HashMap::new(),
            url_path: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.url_path = path.into();
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Client-IP precedence used by ip-hash and consistent-hash:
    /// `X-Forwarded-For` (read as a single opaque token, not a
    /// comma-separated list — a documented limitation carried over from the
    /// source this core was modeled on), else `X-Real-IP`, else the remote
    /// address. `None` when all three are empty.
    pub fn client_key(&self) -> Option<&str> {
        self.header("X-Forwarded-For")
            .or_else(|| self.header("X-Real-IP"))
            .or_else(|| {
                if self.remote_address.is_empty() {
                    None
                } else {
                    Some(self.remote_address.as_str())
                }
            })
    }
}

/// Strategy-specific statistics, heterogeneous by design (a counter here, a
/// weight map there) — the observable shape is whatever each strategy
/// chooses to expose under `GetStats`.
pub type Stats = HashMap<String, serde_json::Value>;

/// Common capability set every load-balancing strategy implements. Chosen
/// over an enum-dispatch tagged union because strategy-specific state
/// (rings, weight vectors, connection maps) is naturally heterogeneous and
/// each variant is already behind a single `Box` at construction time — no
/// hot-path boxing is added beyond that one indirection.
pub trait Balancer: Send + Sync {
    /// Select one eligible node for `ctx`, or `None` if no node in
    /// `service.nodes` is currently eligible. Implementations must filter to
    /// eligible nodes first, short-circuit on 0/1 eligible nodes, and apply
    /// their strategy only when 2+ nodes are eligible.
    fn select(&self, service: &ServiceConfig, ctx: &RequestContext) -> Option<NodeConfig>;

    /// Release a connection previously counted by `select` (least-conn
    /// only). A no-op for every other strategy.
    fn release(&self, _node_id: &str) {}

    fn strategy(&self) -> Strategy;

    fn get_stats(&self) -> Stats;

    /// Discard all strategy-internal state (counters, rings, weight
    /// vectors, connection maps). Called whenever a service's balancer is
    /// rebuilt.
    fn reset(&self);

    /// Hook for `UpdateNodeWeight`. Most strategies need nothing here —
    /// consistent-hash detects a weight change on its own via the eligible-set
    /// signature check already in `select`. Weighted round-robin overrides
    /// this to drop the node's stale `currentWeight` entry so it is
    /// recomputed fresh on the next pick, rather than clearing the whole map
    /// (which would cost every other node its accumulated state too).
    fn on_weight_changed(&self, _node_id: &str) {}

    fn get_config(&self) -> &LoadBalancerConfig;
}

/// Constructs the right `Balancer` for a `ServiceConfig`, and validates the
/// config the way the spec's Factory component does (non-empty id/name/
/// nodes, non-negative weights are structural in `u32` so only emptiness is
/// checked here; URL/id shape is validated by [`crate::config::validate_service`]).
pub struct BalancerFactory;

impl BalancerFactory {
    pub fn build(service: &ServiceConfig) -> GatewayResult<Box<dyn Balancer>> {
        crate::config::validate_service(service)?;

        let cfg = service.load_balancer.clone();
        let balancer: Box<dyn Balancer> = match service.strategy {
            Strategy::RoundRobin => Box::new(RoundRobinBalancer::new(cfg)),
            Strategy::Random => Box::new(RandomBalancer::new(cfg)),
            Strategy::IpHash => Box::new(IpHashBalancer::new(cfg)),
            Strategy::LeastConn => Box::new(LeastConnBalancer::new(cfg)),
            Strategy::WeightedRoundRobin => Box::new(WeightedRoundRobinBalancer::new(cfg)),
            Strategy::ConsistentHash => Box::new(ConsistentHashBalancer::new(cfg)),
        };
        Ok(balancer)
    }

    /// Parses a strategy name the way an admin surface accepting a bare
    /// string (rather than the strongly-typed `Strategy` enum) would. Kebab-
    /// or snake-case are both accepted since external callers tend to mix
    /// conventions.
    pub fn strategy_from_str(s: &str) -> GatewayResult<Strategy> {
        match s.replace('_', "-").to_ascii_lowercase().as_str() {
            "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "ip-hash" => Ok(Strategy::IpHash),
            "least-conn" => Ok(Strategy::LeastConn),
            "weighted-round-robin" => Ok(Strategy::WeightedRoundRobin),
            "consistent-hash" => Ok(Strategy::ConsistentHash),
            other => Err(GatewayError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Folds an MD5 digest down to a 32-bit integer by multiplying the first
/// four bytes by 31 (per the source this core was modeled on), rather than
/// the more common big-endian byte concatenation. Used by ip-hash only —
/// consistent-hash has its own fold, [`md5_fold_be`], per a distinct source
/// formula for its ring.
pub(crate) fn md5_fold(input: &str) -> u32 {
    let digest = md5::compute(input.as_bytes());
    let mut hash: i64 = 0;
    for &b in &digest.0[..4] {
        hash = hash.wrapping_mul(31).wrapping_add(b as i64);
    }
    hash.unsigned_abs() as u32
}

/// Folds an MD5 digest down to a 32-bit integer via big-endian concatenation
/// of the first four bytes — the consistent-hash ring's hash function, kept
/// distinct from ip-hash's multiply-by-31 fold ([`md5_fold`]) because the
/// source specifies the two strategies use different fold formulas.
pub(crate) fn md5_fold_be(input: &str) -> u32 {
    let digest = md5::compute(input.as_bytes());
    u32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

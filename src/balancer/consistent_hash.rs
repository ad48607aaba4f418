use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{md5_fold_be, Balancer, RequestContext, Stats};
use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};

const BASE_REPLICAS: u32 = 150;

/// Consistent-hash ring. Virtual points are `base_replicas * effective_weight`
/// per node, so heavier nodes claim proportionally more of the ring. Ring
/// points and lookup keys are hashed with [`md5_fold_be`] — a distinct fold
/// from ip-hash's multiply-by-31 scheme, per the source's own formula for
/// this strategy.
///
/// The ring is cached and keyed by a signature of `(id, effective_weight)`
/// pairs for the current eligible set; any change to that set — a node
/// added or removed, a weight change, *or a health transition* — rebuilds
/// it. This differs from (and fixes) the common mistake of only rebuilding
/// when the ring is empty, which misses a silent health flip of a member
/// node.
pub struct ConsistentHashBalancer {
    config: LoadBalancerConfig,
    state: Mutex<RingState>,
    fallback_counter: AtomicU64,
}

#[derive(Default)]
struct RingState {
    ring: BTreeMap<u32, String>,
    signature: Vec<(String, u32)>,
}

impl ConsistentHashBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RingState::default()),
            fallback_counter: AtomicU64::new(0),
        }
    }

    fn signature_of(eligible: &[NodeConfig]) -> Vec<(String, u32)> {
        let mut sig: Vec<(String, u32)> = eligible.iter().map(|n| (n.id.clone(), n.effective_weight())).collect();
        sig.sort_by(|a, b| a.0.cmp(&b.0));
        sig
    }

    fn build_ring(eligible: &[NodeConfig]) -> BTreeMap<u32, String> {
        let mut ring = BTreeMap::new();
        for node in eligible {
            let points = BASE_REPLICAS * node.effective_weight();
            for i in 0..points {
                let key = format!("{}-{}", node.id, i);
                ring.insert(md5_fold_be(&key), node.id.clone());
            }
        }
        ring
    }

    fn lookup_key(&self, ctx: &RequestContext) -> String {
        if let Some(key) = ctx.client_key() {
            return key.to_string();
        }
        if !ctx.url_path.is_empty() {
            return ctx.url_path.clone();
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let n = self.fallback_counter.fetch_add(1, Ordering::Relaxed);
        format!("__fallback__/{nanos}/{n}")
    }
}

impl Balancer for ConsistentHashBalancer {
    fn select(&self, service: &ServiceConfig, ctx: &RequestContext) -> Option<NodeConfig> {
        let eligible: Vec<NodeConfig> = service.nodes.iter().filter(|n| n.is_eligible()).cloned().collect();
        match eligible.len() {
            0 => return None,
            1 => return Some(eligible.into_iter().next().unwrap()),
            _ => {}
        }

        let mut state = self.state.lock();
        let signature = Self::signature_of(&eligible);
        if state.ring.is_empty() || state.signature != signature {
            state.ring = Self::build_ring(&eligible);
            state.signature = signature;
        }

        let hash = md5_fold_be(&self.lookup_key(ctx));
        let node_id = state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, id)| id.clone())?;

        eligible.into_iter().find(|n| n.id == node_id)
    }

    fn strategy(&self) -> Strategy {
        Strategy::ConsistentHash
    }

    fn get_stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("strategy".into(), Strategy::ConsistentHash.to_string().into());
        let state = self.state.lock();
        stats.insert("ring_size".into(), state.ring.len().into());
        stats.insert("replicas".into(), BASE_REPLICAS.into());
        stats
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.ring.clear();
        state.signature.clear();
    }

    fn get_config(&self) -> &LoadBalancerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(n: usize) -> ServiceConfig {
        ServiceConfig {
            id: "svc".into(),
            name: "svc".into(),
            strategy: Strategy::ConsistentHash,
            nodes: (0..n).map(|i| NodeConfig::new(format!("n{i}"), format!("http://n{i}"))).collect(),
            load_balancer: LoadBalancerConfig::default(),
            health_check: Default::default(),
        }
    }

    #[test]
    fn same_key_maps_to_same_node_when_set_unchanged() {
        let balancer = ConsistentHashBalancer::new(LoadBalancerConfig::default());
        let service = service_with(4);
        let ctx = RequestContext::default().with_header("X-Forwarded-For", "203.0.113.9");

        let first = balancer.select(&service, &ctx).unwrap().id;
        for _ in 0..50 {
            assert_eq!(balancer.select(&service, &ctx).unwrap().id, first);
        }
    }

    #[test]
    fn minimal_disruption_on_single_node_removal() {
        let balancer = ConsistentHashBalancer::new(LoadBalancerConfig::default());
        let mut service = service_with(4);

        let keys: Vec<String> = (0..10_000u32).map(|i| format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| {
                let ctx = RequestContext::default().with_header("X-Forwarded-For", k.clone());
                balancer.select(&service, &ctx).unwrap().id
            })
            .collect();

        service.nodes.retain(|n| n.id != "n1");
        balancer.reset();

        let after: Vec<String> = keys
            .iter()
            .map(|k| {
                let ctx = RequestContext::default().with_header("X-Forwarded-For", k.clone());
                balancer.select(&service, &ctx).unwrap().id
            })
            .collect();

        let moved = before.iter().zip(after.iter()).filter(|(b, a)| b != a).count();
        let fraction = moved as f64 / keys.len() as f64;
        // Removing 1 of 4 nodes should reassign close to 1/4 of keys; bounds
        // taken verbatim from the scenario this test seeds.
        assert!(fraction >= 0.20 && fraction <= 0.30, "fraction reassigned: {fraction}");
    }

    #[test]
    fn rebuilds_on_health_transition_without_explicit_reset() {
        let balancer = ConsistentHashBalancer::new(LoadBalancerConfig::default());
        let mut service = service_with(3);
        let ctx = RequestContext::default().with_header("X-Forwarded-For", "198.51.100.3");

        let first = balancer.select(&service, &ctx).unwrap();
        service.nodes.iter_mut().find(|n| n.id == first.id).unwrap().health = false;

        // No explicit reset — the signature check inside select() must
        // notice the eligible set shrank and rebuild on its own.
        let second = balancer.select(&service, &ctx).unwrap();
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn no_eligible_nodes_returns_none() {
        let balancer = ConsistentHashBalancer::new(LoadBalancerConfig::default());
        let mut service = service_with(2);
        service.nodes.iter_mut().for_each(|n| n.health = false);
        assert!(balancer.select(&service, &RequestContext::default()).is_none());
    }
}

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Balancer, RequestContext, Stats};
use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};

/// Uniform random selection over the eligible set. Each balancer owns its
/// own xorshift state (process-seeded from the clock at construction) so
/// distinct services never share a PRNG stream.
pub struct RandomBalancer {
    config: LoadBalancerConfig,
    state: AtomicU32,
}

impl RandomBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0xDEAD_BEEF)
            | 1; // xorshift degenerates at seed 0
        Self {
            config,
            state: AtomicU32::new(seed),
        }
    }

    /// xorshift32, one step per call. `Relaxed` CAS loop: contention only
    /// matters for uniformity, not ordering, and collisions just retry.
    fn next_u32(&self) -> u32 {
        loop {
            let x = self.state.load(Ordering::Relaxed);
            let mut next = x;
            next ^= next << 13;
            next ^= next >> 17;
            next ^= next << 5;
            if self
                .state
                .compare_exchange_weak(x, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl Balancer for RandomBalancer {
    fn select(&self, service: &ServiceConfig, _ctx: &RequestContext) -> Option<NodeConfig> {
        let eligible: Vec<NodeConfig> = service.nodes.iter().filter(|n| n.is_eligible()).cloned().collect();
        match eligible.len() {
            0 => None,
            1 => Some(eligible.into_iter().next().unwrap()),
            n => {
                let idx = (self.next_u32() as usize) % n;
                Some(eligible.into_iter().nth(idx).unwrap())
            }
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Random
    }

    fn get_stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("strategy".into(), Strategy::Random.to_string().into());
        stats
    }

    fn reset(&self) {}

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
            strategy: Strategy::Random,
            nodes: (0..n).map(|i| NodeConfig::new(format!("n{i}"), format!("http://n{i}"))).collect(),
            load_balancer: LoadBalancerConfig::default(),
            health_check: Default::default(),
        }
    }

    #[test]
    fn always_returns_an_eligible_node() {
        let balancer = RandomBalancer::new(LoadBalancerConfig::default());
        let service = service_with(4);
        let ctx = RequestContext::default();

        for _ in 0..200 {
            let picked = balancer.select(&service, &ctx).unwrap();
            assert!(service.nodes.iter().any(|n| n.id == picked.id && n.is_eligible()));
        }
    }

    #[test]
    fn eventually_visits_every_eligible_node() {
        let balancer = RandomBalancer::new(LoadBalancerConfig::default());
        let service = service_with(3);
        let ctx = RequestContext::default();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(balancer.select(&service, &ctx).unwrap().id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn no_eligible_nodes_returns_none() {
        let balancer = RandomBalancer::new(LoadBalancerConfig::default());
        let mut service = service_with(2);
        service.nodes.iter_mut().for_each(|n| n.health = false);
        assert!(balancer.select(&service, &RequestContext::default()).is_none());
    }
}

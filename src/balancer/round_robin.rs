use std::sync::atomic::{AtomicU64, Ordering};

use super::{Balancer, RequestContext, Stats};
use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};

/// Plain round-robin: a shared, monotonically increasing counter indexes
/// into the eligible set. The counter is never reset on topology change —
/// its absolute value is immaterial, only `counter mod len` matters.
pub struct RoundRobinBalancer {
    config: LoadBalancerConfig,
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobinBalancer {
    fn select(&self, service: &ServiceConfig, _ctx: &RequestContext) -> Option<NodeConfig> {
        let eligible: Vec<NodeConfig> = service.nodes.iter().filter(|n| n.is_eligible()).cloned().collect();
        match eligible.len() {
            0 => None,
            1 => Some(eligible.into_iter().next().unwrap()),
            n => {
                let c = self.counter.fetch_add(1, Ordering::Relaxed);
                let idx = (c % n as u64) as usize;
                Some(eligible.into_iter().nth(idx).unwrap())
            }
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }

    fn get_stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("strategy".into(), Strategy::RoundRobin.to_string().into());
        stats.insert("counter".into(), self.counter.load(Ordering::Relaxed).into());
        stats
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    fn get_config(&self) -> &LoadBalancerConfig {
        &self.config
    }
}

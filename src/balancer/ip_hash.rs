use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{md5_fold, Balancer, RequestContext, Stats};
use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};

/// Hashes the client key (see [`RequestContext::client_key`]) to an index
/// into the eligible set via MD5-fold-to-u32. The same client key always
/// lands on the same node as long as the eligible set doesn't change —
/// membership changes reshuffle the mapping, same as any modulo-hash
/// scheme (the consistent-hash strategy exists for when that's undesirable).
pub struct IpHashBalancer {
    config: LoadBalancerConfig,
    fallback_seed: AtomicU32,
}

impl IpHashBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            fallback_seed: AtomicU32::new(0x5EED_1234),
        }
    }

    /// Time-based pseudo-random index used when the client key is empty.
    fn fallback_index(&self, n: usize) -> usize {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let mixed = self.fallback_seed.fetch_add(nanos.wrapping_add(1), Ordering::Relaxed);
        (mixed as usize) % n
    }
}

impl Balancer for IpHashBalancer {
    fn select(&self, service: &ServiceConfig, ctx: &RequestContext) -> Option<NodeConfig> {
        let eligible: Vec<NodeConfig> = service.nodes.iter().filter(|n| n.is_eligible()).cloned().collect();
        match eligible.len() {
            0 => None,
            1 => Some(eligible.into_iter().next().unwrap()),
            n => {
                let idx = match ctx.client_key() {
                    Some(key) => (md5_fold(key) as usize) % n,
                    None => self.fallback_index(n),
                };
                Some(eligible.into_iter().nth(idx).unwrap())
            }
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::IpHash
    }

    fn get_stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("strategy".into(), Strategy::IpHash.to_string().into());
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
            strategy: Strategy::IpHash,
            nodes: (0..n).map(|i| NodeConfig::new(format!("n{i}"), format!("http://n{i}"))).collect(),
            load_balancer: LoadBalancerConfig::default(),
            health_check: Default::default(),
        }
    }

    #[test]
    fn same_client_key_is_stable_across_calls() {
        let balancer = IpHashBalancer::new(LoadBalancerConfig::default());
        let service = service_with(3);
        let ctx = RequestContext::default().with_header("X-Forwarded-For", "10.0.0.7");

        let first = balancer.select(&service, &ctx).unwrap().id;
        for _ in 0..100 {
            assert_eq!(balancer.select(&service, &ctx).unwrap().id, first);
        }
    }

    #[test]
    fn forwarded_for_takes_precedence_over_real_ip_and_remote_addr() {
        let balancer = IpHashBalancer::new(LoadBalancerConfig::default());
        let service = service_with(5);

        let xff_only = RequestContext::default().with_header("X-Forwarded-For", "1.2.3.4");
        let with_all = RequestContext::new("9.9.9.9")
            .with_header("X-Forwarded-For", "1.2.3.4")
            .with_header("X-Real-IP", "8.8.8.8");

        assert_eq!(
            balancer.select(&service, &xff_only).unwrap().id,
            balancer.select(&service, &with_all).unwrap().id
        );
    }

    #[test]
    fn falls_back_to_remote_address_when_headers_absent() {
        let balancer = IpHashBalancer::new(LoadBalancerConfig::default());
        let service = service_with(3);
        let ctx = RequestContext::new("203.0.113.5");

        let first = balancer.select(&service, &ctx).unwrap().id;
        for _ in 0..20 {
            assert_eq!(balancer.select(&service, &ctx).unwrap().id, first);
        }
    }

    #[test]
    fn empty_client_key_still_returns_an_eligible_node() {
        let balancer = IpHashBalancer::new(LoadBalancerConfig::default());
        let service = service_with(3);
        let ctx = RequestContext::default();

        for _ in 0..20 {
            assert!(balancer.select(&service, &ctx).is_some());
        }
    }
}

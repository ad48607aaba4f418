use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Balancer, RequestContext, Stats};
use crate::config::{LoadBalancerConfig, NodeConfig, ServiceConfig, Strategy};

/// Selects the eligible node with the fewest outstanding connections,
/// tie-broken by insertion order. Callers must pair every successful
/// `select` with exactly one `release` once the connection completes.
pub struct LeastConnBalancer {
    config: LoadBalancerConfig,
    open: Mutex<HashMap<String, u64>>,
}

impl LeastConnBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            open: Mutex::new(HashMap::new()),
        }
    }
}

impl Balancer for LeastConnBalancer {
    fn select(&self, service: &ServiceConfig, _ctx: &RequestContext) -> Option<NodeConfig> {
        let eligible: Vec<NodeConfig> = service.nodes.iter().filter(|n| n.is_eligible()).cloned().collect();
        match eligible.len() {
            0 => None,
            1 => Some(eligible.into_iter().next().unwrap()),
            _ => {
                let mut open = self.open.lock();
                for n in &eligible {
                    open.entry(n.id.clone()).or_insert(0);
                }

                let mut best_idx = 0usize;
                let mut best_count = u64::MAX;
                for (idx, n) in eligible.iter().enumerate() {
                    let count = *open.get(&n.id).unwrap_or(&0);
                    if count < best_count {
                        best_count = count;
                        best_idx = idx;
                    }
                }

                let chosen = eligible[best_idx].clone();
                *open.entry(chosen.id.clone()).or_insert(0) += 1;
                Some(chosen)
            }
        }
    }

    fn release(&self, node_id: &str) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(node_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::LeastConn
    }

    fn get_stats(&self) -> Stats {
        let mut stats = Stats::new();
        stats.insert("strategy".into(), Strategy::LeastConn.to_string().into());
        let open = self.open.lock();
        let connections: serde_json::Map<String, serde_json::Value> = open
            .iter()
            .map(|(id, count)| (id.clone(), serde_json::Value::from(*count)))
            .collect();
        stats.insert("connections".into(), serde_json::Value::Object(connections));
        stats
    }

    fn reset(&self) {
        self.open.lock().clear();
    }

    fn get_config(&self) -> &LoadBalancerConfig {
        &self.config
    }
}

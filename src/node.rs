//! The authoritative, in-memory node table for a single service.
//!
//! Mirrors the ownership rule in the design notes: a single owning table
//! (here) keyed by stable string id, with balancers and the health checker
//! addressing nodes by id rather than holding shared pointers into it.
//! Callers crossing the component boundary always get an owned
//! [`NodeConfig`] copy, never a reference into the table.

use parking_lot::RwLock;

use crate::config::NodeConfig;
use crate::error::{GatewayError, GatewayResult};

pub struct NodeTable {
    service_id: String,
    nodes: RwLock<Vec<NodeConfig>>,
}

impl NodeTable {
    pub fn new(service_id: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            service_id: service_id.into(),
            nodes: RwLock::new(nodes),
        }
    }

    /// All nodes, in canonical (insertion) order, as copies.
    pub fn all(&self) -> Vec<NodeConfig> {
        self.nodes.read().clone()
    }

    /// Eligible nodes (`enabled && health`), in canonical order, as copies.
    pub fn eligible(&self) -> Vec<NodeConfig> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.is_eligible())
            .cloned()
            .collect()
    }

    pub fn healthy(&self) -> Vec<NodeConfig> {
        self.nodes.read().iter().filter(|n| n.health).cloned().collect()
    }

    pub fn unhealthy(&self) -> Vec<NodeConfig> {
        self.nodes.read().iter().filter(|n| !n.health).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<NodeConfig> {
        self.nodes.read().iter().find(|n| n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn add(&self, node: NodeConfig) -> GatewayResult<()> {
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.id == node.id) {
            return Err(GatewayError::NodeExists {
                service: self.service_id.clone(),
                node: node.id.clone(),
            });
        }
        nodes.push(node);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> GatewayResult<NodeConfig> {
        let mut nodes = self.nodes.write();
        let idx = nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| GatewayError::NodeNotFound {
                service: self.service_id.clone(),
                node: id.to_string(),
            })?;
        Ok(nodes.remove(idx))
    }

    pub fn update_weight(&self, id: &str, weight: u32) -> GatewayResult<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| GatewayError::NodeNotFound {
                service: self.service_id.clone(),
                node: id.to_string(),
            })?;
        node.weight = weight;
        Ok(())
    }

    /// Applies a health transition. Returns `Some(new_health)` only when the
    /// node's observable `health` field actually flipped — the caller uses
    /// this to decide whether to emit a transition callback, matching the
    /// "exactly one callback notification per transition" invariant.
    pub fn apply_probe_result(
        &self,
        id: &str,
        success: bool,
        now_millis: u64,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> GatewayResult<Option<bool>> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| GatewayError::NodeNotFound {
                service: self.service_id.clone(),
                node: id.to_string(),
            })?;

        node.last_health_check = Some(now_millis);

        let mut transitioned = None;
        if success {
            node.consecutive_success += 1;
            node.consecutive_failure = 0;
            if !node.health && node.consecutive_success >= healthy_threshold.max(1) {
                node.health = true;
                transitioned = Some(true);
            }
        } else {
            node.consecutive_failure += 1;
            node.consecutive_success = 0;
            if node.health && node.consecutive_failure >= unhealthy_threshold.max(1) {
                node.health = false;
                transitioned = Some(false);
            }
        }

        Ok(transitioned)
    }

    /// Explicit admin override of observed health (bypasses the probe
    /// hysteresis counters, as the "UpdateNodeHealth" admin call does).
    /// Returns `Some(previous_health)` when this changed `health`.
    pub fn update_health(&self, id: &str, healthy: bool) -> GatewayResult<Option<bool>> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| GatewayError::NodeNotFound {
                service: self.service_id.clone(),
                node: id.to_string(),
            })?;
        let previous = node.health;
        node.health = healthy;
        node.consecutive_success = 0;
        node.consecutive_failure = 0;
        if previous != healthy {
            Ok(Some(previous))
        } else {
            Ok(None)
        }
    }

    pub fn update_status(&self, id: &str, enabled: bool) -> GatewayResult<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| GatewayError::NodeNotFound {
                service: self.service_id.clone(),
                node: id.to_string(),
            })?;
        node.enabled = enabled;
        Ok(())
    }
}

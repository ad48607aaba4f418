use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::{CheckerMode, Service};
use crate::balancer::RequestContext;
use crate::config::{HealthConfig, NodeConfig, ServiceConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::health::{Callback, ServiceDirectory};

/// Lifecycle owner of every `Service` this gateway instance knows about.
/// A reader/writer lock per key (via [`DashMap`]) rather than one lock over
/// the whole table, so `SelectNode` against service A never contends with a
/// topology mutation against service B.
pub struct ServiceManager {
    services: DashMap<String, Arc<Service>>,
    checker_mode: CheckerMode,
}

impl ServiceManager {
    pub fn new(checker_mode: CheckerMode) -> Self {
        Self {
            services: DashMap::new(),
            checker_mode,
        }
    }

    pub fn add_service(&self, cfg: ServiceConfig) -> GatewayResult<()> {
        if self.services.contains_key(&cfg.id) {
            return Err(GatewayError::ServiceExists(cfg.id));
        }
        let id = cfg.id.clone();
        let service = Service::new(cfg, self.checker_mode)?;
        self.services.insert(id.clone(), Arc::new(service));
        info!(service_id = %id, "service added");
        Ok(())
    }

    pub fn remove_service(&self, id: &str) -> GatewayResult<()> {
        let (_, service) = self
            .services
            .remove(id)
            .ok_or_else(|| GatewayError::ServiceNotFound(id.to_string()))?;
        service.close()?;
        info!(service_id = %id, "service removed");
        Ok(())
    }

    /// Atomic replace: the new `Service` (and its balancer/checker) is built
    /// first. Only once that succeeds is the old one stopped and dropped —
    /// if the build fails, the existing service is untouched and the error
    /// propagates to the caller.
    pub fn update_service(&self, cfg: ServiceConfig) -> GatewayResult<()> {
        let id = cfg.id.clone();
        if !self.services.contains_key(&id) {
            return Err(GatewayError::ServiceNotFound(id));
        }

        let replacement = Arc::new(Service::new(cfg, self.checker_mode)?);
        if let Some(mut entry) = self.services.get_mut(&id) {
            let previous = std::mem::replace(&mut *entry, replacement);
            previous.close()?;
        }
        info!(service_id = %id, "service updated");
        Ok(())
    }

    fn get(&self, id: &str) -> GatewayResult<Arc<Service>> {
        self.services
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| GatewayError::ServiceNotFound(id.to_string()))
    }

    pub fn select_node(&self, id: &str, ctx: &RequestContext) -> GatewayResult<NodeConfig> {
        self.get(id)?.select_node(ctx)
    }

    pub fn release(&self, id: &str, node_id: &str) -> GatewayResult<()> {
        self.get(id)?.release(node_id);
        Ok(())
    }

    pub fn add_node(&self, id: &str, node: NodeConfig) -> GatewayResult<()> {
        self.get(id)?.add_node(node)
    }

    pub fn remove_node(&self, id: &str, node_id: &str) -> GatewayResult<NodeConfig> {
        self.get(id)?.remove_node(node_id)
    }

    pub fn update_node_weight(&self, id: &str, node_id: &str, weight: u32) -> GatewayResult<()> {
        self.get(id)?.update_node_weight(node_id, weight)
    }

    pub fn update_node_health(&self, id: &str, node_id: &str, healthy: bool) -> GatewayResult<()> {
        self.get(id)?.update_node_health(node_id, healthy)
    }

    pub fn update_node_status(&self, id: &str, node_id: &str, enabled: bool) -> GatewayResult<()> {
        self.get(id)?.update_node_status(node_id, enabled)
    }

    pub fn healthy_nodes(&self, id: &str) -> GatewayResult<Vec<NodeConfig>> {
        Ok(self.get(id)?.healthy_nodes())
    }

    pub fn unhealthy_nodes(&self, id: &str) -> GatewayResult<Vec<NodeConfig>> {
        Ok(self.get(id)?.unhealthy_nodes())
    }

    pub fn all_nodes(&self, id: &str) -> GatewayResult<Vec<NodeConfig>> {
        Ok(self.get(id)?.all_nodes())
    }

    pub fn list_services(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_service_stats(&self, id: &str) -> GatewayResult<serde_json::Value> {
        Ok(self.get(id)?.stats())
    }

    pub fn register_callback(&self, id: &str, callback: Callback) -> GatewayResult<()> {
        self.get(id)?.register_callback(callback);
        Ok(())
    }

    /// Stops every checker and resets every balancer. Idempotent and
    /// partial-failure tolerant: attempts every service regardless of
    /// earlier failures, and returns the last error observed rather than
    /// short-circuiting on the first one.
    pub fn close(&self) -> GatewayResult<()> {
        let mut last_err = None;
        for entry in self.services.iter() {
            if let Err(e) = entry.value().close() {
                warn!(service_id = %entry.key(), "error closing service: {e}");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ServiceDirectory for ServiceManager {
    fn service_ids(&self) -> Vec<String> {
        self.list_services()
    }

    fn health_config(&self, service_id: &str) -> Option<HealthConfig> {
        self.services.get(service_id).map(|s| s.health_config())
    }

    fn nodes(&self, service_id: &str) -> Vec<NodeConfig> {
        self.services.get(service_id).map(|s| s.all_nodes()).unwrap_or_default()
    }

    fn apply_probe_result(&self, service_id: &str, node_id: &str, success: bool) -> GatewayResult<Option<bool>> {
        self.get(service_id)?.apply_probe_result(node_id, success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancerConfig, Strategy};

    fn cfg(id: &str) -> ServiceConfig {
        ServiceConfig {
            id: id.into(),
            name: id.into(),
            strategy: Strategy::RoundRobin,
            nodes: vec![NodeConfig::new("n1", "http://n1")],
            load_balancer: LoadBalancerConfig::default(),
            health_check: HealthConfig {
                enabled: false,
                ..HealthConfig::default()
            },
        }
    }

    #[test]
    fn add_then_duplicate_add_fails() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        manager.add_service(cfg("svc")).unwrap();
        assert!(matches!(manager.add_service(cfg("svc")).unwrap_err(), GatewayError::ServiceExists(_)));
    }

    #[test]
    fn select_on_missing_service_errors() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        let err = manager.select_node("nope", &RequestContext::default()).unwrap_err();
        assert!(matches!(err, GatewayError::ServiceNotFound(_)));
    }

    #[test]
    fn remove_then_select_errors() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        manager.add_service(cfg("svc")).unwrap();
        manager.remove_service("svc").unwrap();
        assert!(manager.select_node("svc", &RequestContext::default()).is_err());
    }

    #[test]
    fn update_service_failure_leaves_old_service_intact() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        manager.add_service(cfg("svc")).unwrap();

        let mut bad = cfg("svc");
        bad.nodes.clear();
        assert!(manager.update_service(bad).is_err());

        // old service still selects fine
        assert!(manager.select_node("svc", &RequestContext::default()).is_ok());
    }

    #[test]
    fn close_is_idempotent_and_tolerates_being_called_after_services_removed() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        manager.add_service(cfg("svc")).unwrap();
        manager.close().unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn service_directory_reports_due_nodes_and_applies_probe_results() {
        let manager = ServiceManager::new(CheckerMode::Shared);
        manager.add_service(cfg("svc")).unwrap();

        assert_eq!(ServiceDirectory::service_ids(&manager), vec!["svc".to_string()]);
        assert_eq!(ServiceDirectory::nodes(&manager, "svc").len(), 1);
        assert!(ServiceDirectory::apply_probe_result(&manager, "svc", "n1", true).unwrap().is_none());
    }
}

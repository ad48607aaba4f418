mod duration;
mod types;

pub use duration::Duration;
pub use types::*;

use crate::error::{GatewayError, GatewayResult};
use std::collections::HashSet;
use std::path::Path;

impl Config {
    /// Load and validate a topology file. This is a convenience for the
    /// demo binary and for tests — `ServiceManager` itself is handed already
    /// -parsed `ServiceConfig` values by its caller and never touches the
    /// filesystem.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen_ids = HashSet::new();
        for service in &self.services {
            if !seen_ids.insert(service.id.clone()) {
                return Err(GatewayError::Validation(format!(
                    "duplicate service id: {}",
                    service.id
                )));
            }
            validate_service(service)?;
        }
        Ok(())
    }
}

/// Validate a single `ServiceConfig` the way [`crate::balancer::BalancerFactory`]
/// does at construction time, exposed separately so `ServiceManager::add_service`
/// can reuse it without round-tripping through YAML.
pub fn validate_service(service: &ServiceConfig) -> GatewayResult<()> {
    if service.id.trim().is_empty() {
        return Err(GatewayError::Validation("service id must not be empty".into()));
    }
    if service.name.trim().is_empty() {
        return Err(GatewayError::Validation(format!(
            "service '{}': name must not be empty",
            service.id
        )));
    }
    if service.nodes.is_empty() {
        return Err(GatewayError::Validation(format!(
            "service '{}': must have at least one node",
            service.id
        )));
    }

    let mut seen_node_ids = HashSet::new();
    for node in &service.nodes {
        validate_node(&service.id, node)?;
        if !seen_node_ids.insert(node.id.clone()) {
            return Err(GatewayError::Validation(format!(
                "service '{}': duplicate node id '{}'",
                service.id, node.id
            )));
        }
    }

    Ok(())
}

pub fn validate_node(service_id: &str, node: &NodeConfig) -> GatewayResult<()> {
    if node.id.trim().is_empty() {
        return Err(GatewayError::Validation(format!(
            "service '{}': node id must not be empty",
            service_id
        )));
    }
    if node.url.trim().is_empty() {
        return Err(GatewayError::Validation(format!(
            "service '{}': node '{}' has an empty url",
            service_id, node.id
        )));
    }
    url::Url::parse(&node.url).map_err(|e| {
        GatewayError::Validation(format!(
            "service '{}': node '{}' has an invalid url '{}': {}",
            service_id, node.id, node.url, e
        ))
    })?;
    Ok(())
}

use thiserror::Error;

/// Crate-wide result alias.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Structured error kinds surfaced by the selection and admin paths.
///
/// The selection path (`Selector::select_node` / `Service::select_node`) can
/// only ever return [`GatewayError::ServiceNotFound`] or
/// [`GatewayError::NoAvailableNode`] — every other variant is an admin-path
/// or construction-time error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already exists: {0}")]
    ServiceExists(String),

    #[error("node not found: {service}/{node}")]
    NodeNotFound { service: String, node: String },

    #[error("node already exists: {service}/{node}")]
    NodeExists { service: String, node: String },

    #[error("no available node for service: {0}")]
    NoAvailableNode(String),

    #[error("invalid load balancing strategy: {0}")]
    InvalidStrategy(String),

    #[error("health checker already running")]
    CheckerAlreadyRunning,

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

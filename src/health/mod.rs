mod checker;
mod prober;
mod shared;

pub use checker::{AdvancedHealthChecker, HealthChecker, NoOpHealthChecker};
pub use prober::{HttpProber, PredicateProber, Prober};
pub use shared::{ServiceDirectory, SharedHealthCheckerManager};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::GatewayResult;

/// `fn(node_id, healthy)`, invoked once per health transition.
pub type Callback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Lifecycle every checker variant implements. `start`/`stop` are
/// synchronous and return immediately — `start` spawns the scheduling loop
/// as a background task, `stop` signals it to exit and does not wait for
/// outstanding probes (the "prompt-return" contract: probe results that
/// arrive after `stop` are simply discarded).
pub trait Checker: Send + Sync {
    fn start(&self) -> GatewayResult<()>;
    fn stop(&self) -> GatewayResult<()>;

    fn close(&self) -> GatewayResult<()> {
        self.stop()
    }

    fn register_callback(&self, callback: Callback);
}

/// Shared callback fan-out used by every concrete checker: snapshots the
/// registered list, then invokes each one outside of any lock, catching and
/// logging panics so one misbehaving subscriber can't take down the loop or
/// stall the others.
///
/// `UpdateNodeHealth` and the probe-result path are both plain synchronous
/// calls (`Service::update_node_health`, `Service::apply_probe_result`) that
/// an embedding application may invoke from outside any Tokio runtime, so
/// dispatch can't assume one is running: when a runtime handle is available
/// each callback still runs on its own spawned task (fire-and-forget, so one
/// slow subscriber can't stall this call); otherwise the callback runs
/// inline, still behind the same panic guard.
pub(crate) fn notify_transition(callbacks: &RwLock<Vec<Callback>>, node_id: &str, healthy: bool) {
    let snapshot: Vec<Callback> = callbacks.read().clone();
    for cb in snapshot {
        let node_id = node_id.to_string();
        let dispatch = move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| cb(&node_id, healthy)));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(node_id = %node_id, "health transition callback panicked: {msg}");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { dispatch() });
            }
            Err(_) => dispatch(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

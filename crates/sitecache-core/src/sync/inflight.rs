use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::models::Target;

/// Targets with a transmission under way. Immediate sends from the gateway
/// and queue drains claim a target here so they never overlap on it.
#[derive(Clone, Default)]
pub struct Inflight {
    targets: Arc<Mutex<HashSet<Target>>>,
}

impl Inflight {
    /// Claim `target`, or `None` if someone else holds it.
    pub fn try_claim(&self, target: Target) -> Option<InflightGuard> {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        if !targets.insert(target.clone()) {
            return None;
        }
        Some(InflightGuard {
            targets: Arc::clone(&self.targets),
            target,
        })
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(target)
    }
}

/// Releases the claim on drop.
pub struct InflightGuard {
    targets: Arc<Mutex<HashSet<Target>>>,
    target: Target,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.target);
    }
}

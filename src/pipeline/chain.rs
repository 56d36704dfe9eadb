use std::sync::Arc;

use tracing::warn;

use super::Policy;

/// Ordered policy sequence for one route, built once at gateway
/// construction and read-only afterwards.
pub struct MergedPolicyChain {
    policies: Vec<Arc<dyn Policy>>,
}

impl MergedPolicyChain {
    /// Merge the global and route policy tiers.
    ///
    /// Deduplication is by name: a route-tier policy replaces a global one
    /// of the same name in place, keeping the global's insertion slot.
    /// The final order is a stable ascending sort by priority, so equal
    /// priorities preserve insertion order with globals first. This
    /// tie-break is a contract, not an accident of the sort.
    pub fn merge(
        global: &[Arc<dyn Policy>],
        route: &[Arc<dyn Policy>],
        default_priority: i32,
    ) -> Self {
        let mut merged: Vec<Arc<dyn Policy>> = global.to_vec();
        for policy in route {
            match merged
                .iter()
                .position(|existing| existing.name() == policy.name())
            {
                Some(slot) => {
                    warn!(
                        policy = policy.name(),
                        "route-level policy overrides global policy of the same name"
                    );
                    merged[slot] = policy.clone();
                }
                None => merged.push(policy.clone()),
            }
        }
        merged.sort_by_key(|policy| policy.priority().unwrap_or(default_priority));
        Self { policies: merged }
    }

    pub fn policies(&self) -> &[Arc<dyn Policy>] {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

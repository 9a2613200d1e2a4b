use serde::{Deserialize, Serialize};

/// Session-wide override for the generic/custom plan decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanMode {
    /// Decide per statement from accumulated cost statistics.
    Auto,
    /// Always use a parameter-independent plan.
    ForceGeneric,
    /// Always replan against the bound parameter values.
    ForceCustom,
}

/// Tunables for the plan choice policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Session-wide plan mode override. Per-statement cursor flags win.
    pub plan_mode: PlanMode,
    /// Number of custom plans built before the generic estimate is trusted.
    pub min_custom_plans: u64,
    /// Generic plans are preferred while cheaper than the average custom
    /// cost times this factor.
    pub generic_cost_factor: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            plan_mode: PlanMode::Auto,
            min_custom_plans: 5,
            generic_cost_factor: 1.1,
        }
    }
}

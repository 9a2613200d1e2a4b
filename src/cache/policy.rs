//! The generic-versus-custom plan decision.
//!
//! Evaluated fresh on every lookup; nothing here is cached. A custom plan
//! costs a planner run per execution but can exploit the bound values; a
//! generic plan amortizes planning but must stay safe for any values. The
//! policy bootstraps with custom plans until enough cost samples exist to
//! judge the generic estimate.

use crate::cache::source::PlanSource;
use crate::config::{CacheConfig, PlanMode};
use crate::tree::BoundParams;

/// Decides whether the next execution should use a custom plan.
///
/// Decision ladder, first match wins:
/// 1. the dependency snapshot structurally forces custom;
/// 2. one-shot sources are always custom;
/// 3. without bound parameters there is nothing to specialize: generic;
/// 4. transaction control statements: generic;
/// 5. per-statement cursor flags, then the session plan mode;
/// 6. fewer custom builds than the bootstrap threshold: custom;
/// 7. generic wins only while its known cost undercuts the average custom
///    cost times the slack factor. An uncosted generic plan loses, so the
///    policy stays custom until a generic plan has actually been built and
///    costed once.
pub fn choose_custom(
    source: &PlanSource,
    params: Option<&BoundParams>,
    config: &CacheConfig,
) -> bool {
    if source.deps.forces_custom {
        return true;
    }
    if source.is_oneshot() {
        return true;
    }
    if params.is_none() {
        return false;
    }
    if source.is_transaction_control() {
        return false;
    }
    if source.options.force_generic {
        return false;
    }
    if source.options.force_custom {
        return true;
    }
    match config.plan_mode {
        PlanMode::ForceGeneric => return false,
        PlanMode::ForceCustom => return true,
        PlanMode::Auto => {}
    }
    if source.num_custom_plans() < config.min_custom_plans {
        return true;
    }
    let avg_custom = match source.avg_custom_cost() {
        Some(avg) => avg,
        // Reachable only with a zero bootstrap threshold; no samples yet.
        None => return true,
    };
    match source.generic_cost() {
        Some(generic) => generic >= avg_custom * config.generic_cost_factor,
        None => true,
    }
}

//! The plan cache proper: sources, compiled plans, the choice policy, the
//! validator, and the per-session and cross-session stores.

/// Dependency snapshots captured at analysis time.
pub mod dependency;

/// Compiled plans and caller handles.
pub mod plan;

/// The generic-versus-custom decision.
pub mod policy;

/// Invalidation-bus wiring.
pub mod router;

/// Cross-session shared store.
pub mod shared;

/// Plan sources and their lifecycle.
pub mod source;

/// Saved-source registry and the session facade.
pub mod store;

/// Tree and plan revalidation.
pub mod validator;

pub use dependency::DependencySet;
pub use plan::{CompiledPlan, PlanHandle};
pub use policy::choose_custom;
pub use shared::{SharedEntry, SharedKey, SharedPlanGuard, SharedPlanStore, SharedStats};
pub use source::{LinkedPlan, PlanSource, PlanSourceBuilder};
pub use store::{CacheStats, PlanCache, PlanStore, SavedSource};

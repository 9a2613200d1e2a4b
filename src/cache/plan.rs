//! Compiled execution plans and the handles callers hold on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::tree::{PlannedStatement, StatementKind};
use crate::types::{CatalogId, ObjectId, RoleId, TransactionId};

/// An immutable compiled execution plan.
///
/// Exactly one `Arc` strong reference belongs to the owning plan source's
/// link slot (while linked); every [`PlanHandle`] is another. The plan's
/// resources are released exactly once, when the last of those references
/// drops, which can be well after the source unlinked or even dropped it.
#[derive(Debug)]
pub struct CompiledPlan {
    statements: Vec<PlannedStatement>,
    valid: AtomicBool,
    depends_on_role: bool,
    owning_role: RoleId,
    transient_xmin: Option<TransactionId>,
    generation: u64,
}

impl CompiledPlan {
    pub(crate) fn new(
        statements: Vec<PlannedStatement>,
        depends_on_role: bool,
        owning_role: RoleId,
        transient_xmin: Option<TransactionId>,
        generation: u64,
    ) -> Self {
        Self {
            statements,
            valid: AtomicBool::new(true),
            depends_on_role,
            owning_role,
            transient_xmin,
            generation,
        }
    }

    /// The compiled per-statement plans, in statement order.
    pub fn statements(&self) -> &[PlannedStatement] {
        &self.statements
    }

    /// Whether the plan is still trustworthy.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// The plan is specialized to the role it was built for.
    pub fn depends_on_role(&self) -> bool {
        self.depends_on_role
    }

    /// Role the plan was built for.
    pub fn owning_role(&self) -> RoleId {
        self.owning_role
    }

    /// Visibility horizon the plan is pinned to, if any. A plan built with
    /// a horizon must be rebuilt once the horizon advances past it.
    pub fn transient_xmin(&self) -> Option<TransactionId> {
        self.transient_xmin
    }

    /// Generation counter of the owning source at build time.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Summed optimizer cost estimate over the plannable statements.
    pub fn total_cost(&self) -> f64 {
        self.statements
            .iter()
            .filter(|stmt| stmt.kind == StatementKind::Query)
            .map(|stmt| stmt.total_cost)
            .sum()
    }

    /// True if any compiled statement touches `object` (`None` = any
    /// relation at all).
    pub(crate) fn references_object(&self, object: Option<ObjectId>) -> bool {
        self.statements
            .iter()
            .filter(|stmt| stmt.kind == StatementKind::Query)
            .any(|stmt| match object {
                Some(id) => stmt.relations.iter().any(|rel| rel.relation == id),
                None => !stmt.relations.is_empty(),
            })
    }

    /// True if any compiled statement depends on the given catalog entry.
    pub(crate) fn references_catalog_entry(&self, catalog: CatalogId, hash: u64) -> bool {
        self.statements
            .iter()
            .filter(|stmt| stmt.kind == StatementKind::Query)
            .any(|stmt| stmt.inval_items.iter().any(|item| item.matches(catalog, hash)))
    }
}

impl Drop for CompiledPlan {
    fn drop(&mut self) {
        trace!(generation = self.generation, "compiled plan destroyed");
    }
}

/// Caller-held reference to a compiled plan.
///
/// Obtained from an acquire operation; dropping it is the release. The plan
/// outlives its source for as long as any handle exists.
#[derive(Debug, Clone)]
pub struct PlanHandle {
    plan: Arc<CompiledPlan>,
}

impl PlanHandle {
    pub(crate) fn new(plan: Arc<CompiledPlan>) -> Self {
        Self { plan }
    }

    /// The referenced plan.
    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    /// The compiled per-statement plans.
    pub fn statements(&self) -> &[PlannedStatement] {
        self.plan.statements()
    }

    /// Generation of the plan at build time. Comparable only between
    /// handles acquired from the same source.
    pub fn generation(&self) -> u64 {
        self.plan.generation()
    }

    /// True when both handles reference the very same compiled plan.
    pub fn shares_plan(&self, other: &PlanHandle) -> bool {
        Arc::ptr_eq(&self.plan, &other.plan)
    }
}

//! Revalidation: making sure a cached tree or plan is still trustworthy
//! before anyone executes it.
//!
//! Both checks here share one shape: look at the validity flag, take the
//! locks the statement needs, then look again. An invalidation can arrive
//! between the first look and the locks; once the locks are held no
//! conflicting catalog change can commit, so the second look is
//! authoritative. Losing the race is not an error; the entry is rebuilt.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::dependency::DependencySet;
use crate::cache::plan::CompiledPlan;
use crate::cache::source::PlanSource;
use crate::cache::store::PlanCache;
use crate::error::{PlanCacheError, Result};
use crate::provider::LockMode;
use crate::tree::{visit, PlannedStatement, QueryTree, RowShape, StatementKind};
use crate::types::ObjectId;

/// Locks needed to replan an analyzed statement list, in tree order.
fn planner_lock_list(queries: &[QueryTree]) -> Vec<(ObjectId, LockMode)> {
    let mut locks = Vec::new();
    for query in queries {
        visit::for_each_relation(query, &mut |rel| {
            locks.push((rel.relation, LockMode::for_role(rel.role)));
        });
    }
    locks
}

/// Locks needed to execute a compiled statement list.
fn executor_lock_list(statements: &[PlannedStatement]) -> Vec<(ObjectId, LockMode)> {
    let mut locks = Vec::new();
    for stmt in statements {
        if stmt.kind != StatementKind::Query {
            continue;
        }
        for rel in &stmt.relations {
            locks.push((rel.relation, LockMode::for_role(rel.role)));
        }
    }
    locks
}

impl PlanCache {
    /// Ensures the source's analyzed tree is current and the locks needed
    /// for planning are held.
    ///
    /// Returns the freshly reanalyzed statement list when reanalysis
    /// happened, `None` when the stored tree was already good. The return
    /// value only exists to spare the subsequent plan build a tree copy;
    /// callers may ignore it.
    pub(crate) fn revalidate(&self, source: &mut PlanSource) -> Result<Option<Vec<QueryTree>>> {
        // One-shot and transaction-control sources live and die within one
        // transaction; no lock reacquisition or staleness checking applies.
        if source.is_oneshot() || source.is_transaction_control() {
            return Ok(None);
        }

        // An empty statement has nothing that could go stale.
        if source.kind() == StatementKind::Empty {
            source.valid = true;
            return Ok(None);
        }

        // A different search path can resolve the same name to a different
        // object; the stored tree is then the wrong answer even though no
        // catalog object changed.
        if source.valid && !self.catalog().search_path_matches(&source.deps.search_path) {
            source.mark_invalid();
        }

        // Row-security rewrites are role-specific.
        if source.valid
            && source.deps.depends_on_role
            && source.deps.rewrite_role != self.catalog().current_role()
        {
            source.mark_invalid();
        }

        if source.valid {
            let locks = planner_lock_list(source.query_list.as_deref().unwrap_or_default());
            for (relation, mode) in &locks {
                self.catalog().lock(*relation, *mode);
            }
            // An invalidation delivered before the locks were all granted
            // has flipped the flag by now.
            if source.valid {
                return Ok(None);
            }
            // Lost the race; these locks belong to a tree we are about to
            // discard.
            for (relation, mode) in &locks {
                self.catalog().unlock(*relation, *mode);
            }
        }

        debug!(text = %source.text(), "reanalyzing invalidated statement");

        // Drop the stale tree only now: releasing the race-case locks above
        // needed it intact.
        source.discard_tree();

        // Reanalysis acquires planning locks as a side effect of its
        // relation lookups.
        let analyzed =
            self.compiler()
                .analyze_and_rewrite(source.raw(), source.text(), &source.param_spec)?;

        let new_shape = RowShape::of_queries(&analyzed);
        if new_shape != source.result_shape {
            if source.fixed_result {
                warn!(text = %source.text(), "result shape changed on fixed-result statement");
                return Err(PlanCacheError::ResultShapeChanged);
            }
            source.result_shape = new_shape;
        }

        let queries = analyzed.clone();
        source.deps = DependencySet::capture(
            self.compiler().extract_dependencies(&queries),
            self.catalog().current_search_path(),
            self.catalog().current_role(),
        );
        source.query_list = Some(queries);

        // Cost statistics survive the rebuild on purpose: the catalog
        // change that invalidated the tree rarely moves the cost landscape
        // enough to outweigh the accumulated samples.
        source.valid = true;

        // The generation moves on plan builds only, not tree rebuilds.
        Ok(Some(analyzed))
    }

    /// Checks whether the source's linked generic plan can be executed.
    ///
    /// On success the plan is returned with execution locks held, race-free.
    /// On `None`, a stale plan has been unlinked (it survives until the
    /// last caller handle drops) and the caller should build a fresh one.
    pub(crate) fn check_generic_plan(&self, source: &mut PlanSource) -> Option<Arc<CompiledPlan>> {
        debug_assert!(source.valid, "query tree must be revalidated first");

        let plan = match source.linked_plan() {
            Some(linked) if linked.is_generic() => Arc::clone(linked.plan()),
            _ => return None,
        };

        // A role-specialized plan built for someone else is useless here.
        if plan.is_valid()
            && plan.depends_on_role()
            && plan.owning_role() != self.catalog().current_role()
        {
            plan.invalidate();
        }

        if plan.is_valid() {
            let locks = executor_lock_list(plan.statements());
            for (relation, mode) in &locks {
                self.catalog().lock(*relation, *mode);
            }

            // A transient plan is only good while the visibility horizon it
            // was built under still stands.
            if plan.is_valid() {
                if let Some(xmin) = plan.transient_xmin() {
                    if xmin != self.catalog().transaction_xmin() {
                        debug!(generation = plan.generation(), "transient plan outlived its horizon");
                        plan.invalidate();
                    }
                }
            }

            if plan.is_valid() {
                return Some(plan);
            }

            for (relation, mode) in &locks {
                self.catalog().unlock(*relation, *mode);
            }
        }

        debug!(generation = plan.generation(), "unlinking stale generic plan");
        source.unlink_plan();
        None
    }
}

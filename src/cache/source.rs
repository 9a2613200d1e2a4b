//! Plan sources: the long-lived cache entries.
//!
//! A source is built in two steps. [`PlanSourceBuilder`] captures the raw
//! statement right after parsing; [`PlanSourceBuilder::complete`] attaches
//! the analyzed tree plus its dependency snapshot and yields the finished
//! [`PlanSource`]. Because `complete` consumes the builder, a source cannot
//! be completed twice, and because saving moves the source into the store,
//! a saved source cannot be moved elsewhere. Both former runtime checks are
//! now unrepresentable.

use std::sync::Arc;

use tracing::debug;

use crate::cache::dependency::DependencySet;
use crate::cache::plan::CompiledPlan;
use crate::error::{PlanCacheError, Result};
use crate::provider::{CatalogService, QueryCompiler};
use crate::tree::{
    CursorOptions, ParamSpec, QueryTree, RawStatement, RowShape, StatementKind,
};
use crate::types::{CatalogId, ObjectId};

/// The at-most-one compiled plan a source links.
///
/// A single slot holding either flavor keeps "generic and custom are never
/// both present" structural rather than asserted.
#[derive(Debug, Clone)]
pub enum LinkedPlan {
    /// Parameter-independent plan, reusable across executions.
    Generic(Arc<CompiledPlan>),
    /// Plan specialized to one set of bound parameter values.
    Custom(Arc<CompiledPlan>),
}

impl LinkedPlan {
    /// The linked plan, whichever flavor.
    pub fn plan(&self) -> &Arc<CompiledPlan> {
        match self {
            LinkedPlan::Generic(plan) | LinkedPlan::Custom(plan) => plan,
        }
    }

    /// True for the generic flavor.
    pub fn is_generic(&self) -> bool {
        matches!(self, LinkedPlan::Generic(_))
    }
}

/// First construction step: the source right after raw parsing, before
/// analysis results are attached.
#[derive(Debug)]
pub struct PlanSourceBuilder {
    text: String,
    raw: RawStatement,
    oneshot: bool,
}

impl PlanSourceBuilder {
    pub(crate) fn new(text: String, raw: RawStatement, oneshot: bool) -> Self {
        Self { text, raw, oneshot }
    }

    /// True when this builds a one-shot source.
    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    /// Attaches the analyzed-and-rewritten statement list and finishes the
    /// source.
    ///
    /// Dependency extraction and the search-path/role snapshot happen here;
    /// both are skipped for one-shot and transaction-control sources, which
    /// are never invalidated. `fixed_result` pins the result row shape: any
    /// later reanalysis producing a different shape fails instead of
    /// adopting it.
    pub fn complete(
        self,
        compiler: &dyn QueryCompiler,
        catalog: &dyn CatalogService,
        queries: Vec<QueryTree>,
        param_spec: ParamSpec,
        options: CursorOptions,
        fixed_result: bool,
    ) -> Result<PlanSource> {
        let track_deps = !self.oneshot && !self.raw.kind.is_transaction_control();
        let deps = if track_deps {
            DependencySet::capture(
                compiler.extract_dependencies(&queries),
                catalog.current_search_path(),
                catalog.current_role(),
            )
        } else {
            DependencySet {
                rewrite_role: catalog.current_role(),
                ..DependencySet::default()
            }
        };
        let result_shape = RowShape::of_queries(&queries);

        Ok(PlanSource {
            text: self.text,
            raw: self.raw,
            oneshot: self.oneshot,
            saved: false,
            valid: true,
            fixed_result,
            param_spec,
            options,
            result_shape,
            query_list: Some(queries),
            deps,
            linked: None,
            generation: 0,
            generic_cost: None,
            total_custom_cost: 0.0,
            num_custom_plans: 0,
        })
    }
}

/// A completed plan cache entry: the immutable raw statement, its current
/// analyzed tree, the dependency snapshot, and at most one linked compiled
/// plan, plus the running statistics the choice policy feeds on.
#[derive(Debug)]
pub struct PlanSource {
    text: String,
    raw: RawStatement,
    oneshot: bool,
    pub(crate) saved: bool,
    pub(crate) valid: bool,
    pub(crate) fixed_result: bool,
    pub(crate) param_spec: ParamSpec,
    pub(crate) options: CursorOptions,
    pub(crate) result_shape: Option<RowShape>,
    /// `None` after an invalidation discarded the tree, until rebuilt.
    pub(crate) query_list: Option<Vec<QueryTree>>,
    pub(crate) deps: DependencySet,
    pub(crate) linked: Option<LinkedPlan>,
    pub(crate) generation: u64,
    pub(crate) generic_cost: Option<f64>,
    pub(crate) total_custom_cost: f64,
    pub(crate) num_custom_plans: u64,
}

impl PlanSource {
    /// Original statement text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The captured raw parse output.
    pub fn raw(&self) -> &RawStatement {
        &self.raw
    }

    /// Statement classification.
    pub fn kind(&self) -> StatementKind {
        self.raw.kind
    }

    /// True for one-shot sources (single use, never saved or copied).
    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    /// True once the source has been moved into the store.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Whether the analyzed tree is currently trustworthy. Only free of
    /// races once execution locks are held; the acquire path rechecks after
    /// locking.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// True for BEGIN/COMMIT/ROLLBACK and family.
    pub fn is_transaction_control(&self) -> bool {
        self.raw.kind.is_transaction_control()
    }

    /// Monotonic counter bumped on every successful plan build. Comparable
    /// only within this source.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last known cost of the generic plan; `None` until one has been
    /// built and costed.
    pub fn generic_cost(&self) -> Option<f64> {
        self.generic_cost
    }

    /// Number of custom plans built so far.
    pub fn num_custom_plans(&self) -> u64 {
        self.num_custom_plans
    }

    /// Average cost over the custom plans built so far.
    pub fn avg_custom_cost(&self) -> Option<f64> {
        if self.num_custom_plans == 0 {
            None
        } else {
            Some(self.total_custom_cost / self.num_custom_plans as f64)
        }
    }

    /// The currently linked plan, if any.
    pub fn linked_plan(&self) -> Option<&LinkedPlan> {
        self.linked.as_ref()
    }

    /// The dependency snapshot captured at the last (re)analysis.
    pub fn dependencies(&self) -> &DependencySet {
        &self.deps
    }

    /// Current result row shape, if the statement returns tuples.
    pub fn result_shape(&self) -> Option<&RowShape> {
        self.result_shape.as_ref()
    }

    pub(crate) fn link_generic(&mut self, plan: Arc<CompiledPlan>) {
        debug_assert!(self.linked.is_none());
        self.linked = Some(LinkedPlan::Generic(plan));
    }

    pub(crate) fn link_custom(&mut self, plan: Arc<CompiledPlan>) {
        debug_assert!(self.linked.is_none());
        self.linked = Some(LinkedPlan::Custom(plan));
    }

    /// Unlinks the current plan. The plan itself lives on while any caller
    /// handle still references it and is destroyed with the last one.
    pub(crate) fn unlink_plan(&mut self) -> Option<LinkedPlan> {
        self.linked.take()
    }

    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Folds a freshly built custom plan's cost into the running average.
    /// Saturates instead of wrapping once the counter tops out.
    pub(crate) fn record_custom_cost(&mut self, cost: f64) {
        if self.num_custom_plans < u64::MAX {
            self.total_custom_cost += cost;
            self.num_custom_plans = self.num_custom_plans.saturating_add(1);
        }
    }

    /// Marks the tree (and any linked plan) untrustworthy. The tree is not
    /// discarded here; revalidation does that lazily so in-flight lock
    /// bookkeeping stays balanced.
    pub(crate) fn mark_invalid(&mut self) {
        self.valid = false;
        if let Some(linked) = &self.linked {
            linked.plan().invalidate();
        }
    }

    /// Drops the analyzed tree and its dependency snapshot ahead of a
    /// rebuild.
    pub(crate) fn discard_tree(&mut self) {
        self.valid = false;
        self.query_list = None;
        self.deps = DependencySet::default();
    }

    /// Applies an object-change notification to this source. Returns true
    /// if anything was invalidated.
    pub(crate) fn apply_object_change(&mut self, object: Option<ObjectId>) -> bool {
        let mut hit = false;
        if self.deps.references_object(object) {
            self.mark_invalid();
            hit = true;
        }
        // The compiled plan can depend on objects the tree's analysis never
        // surfaced (inlined function bodies); check it separately and
        // invalidate just the plan when only it is affected.
        if let Some(linked) = &self.linked {
            let plan = linked.plan();
            if plan.is_valid() && plan.references_object(object) {
                plan.invalidate();
                hit = true;
            }
        }
        hit
    }

    /// Applies a catalog-entry change notification to this source. Returns
    /// true if anything was invalidated.
    pub(crate) fn apply_catalog_change(&mut self, catalog: CatalogId, hash: u64) -> bool {
        let mut hit = false;
        if self.deps.references_catalog_entry(catalog, hash) {
            self.mark_invalid();
            hit = true;
        }
        if let Some(linked) = &self.linked {
            let plan = linked.plan();
            if plan.is_valid() && plan.references_catalog_entry(catalog, hash) {
                plan.invalidate();
                hit = true;
            }
        }
        hit
    }

    /// Applies an untargeted reset. Only statements that actually carry a
    /// plannable query are affected; bare utility lists have nothing to go
    /// stale.
    pub(crate) fn apply_reset(&mut self) -> bool {
        let has_query = self
            .query_list
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|q| q.kind == StatementKind::Query);
        if has_query {
            self.mark_invalid();
        }
        has_query
    }

    /// Produces an independent, unsaved copy: same tree, dependency
    /// snapshot, and cost statistics, but no linked plan.
    ///
    /// One-shot sources cannot be copied: their trees may have been
    /// scribbled on in place by the planner.
    pub fn duplicate(&self) -> Result<PlanSource> {
        if self.oneshot {
            return Err(PlanCacheError::Unsupported(
                "cannot copy a one-shot plan source",
            ));
        }
        debug!(text = %self.text, "copying plan source");
        Ok(PlanSource {
            text: self.text.clone(),
            raw: self.raw.clone(),
            oneshot: false,
            saved: false,
            valid: self.valid,
            fixed_result: self.fixed_result,
            param_spec: self.param_spec.clone(),
            options: self.options,
            result_shape: self.result_shape.clone(),
            query_list: self.query_list.clone(),
            deps: self.deps.clone(),
            linked: None,
            generation: self.generation,
            generic_cost: self.generic_cost,
            total_custom_cost: self.total_custom_cost,
            num_custom_plans: self.num_custom_plans,
        })
    }
}

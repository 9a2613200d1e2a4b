//! The saved-source registry and the session facade driving it.
//!
//! [`PlanStore`] is an explicit registry object: saved sources are moved
//! into it and reached through [`SavedSource`] handles, never through
//! ambient globals. [`PlanCache`] ties the registry to the engine's
//! compiler and catalog services and exposes the caller-facing operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::plan::{CompiledPlan, PlanHandle};
use crate::cache::policy::choose_custom;
use crate::cache::source::{PlanSource, PlanSourceBuilder};
use crate::config::CacheConfig;
use crate::error::{PlanCacheError, Result};
use crate::provider::{CatalogService, QueryCompiler};
use crate::tree::{
    BoundParams, CursorOptions, ParamSpec, QueryTree, RawStatement, RowShape, StatementKind,
};
use crate::types::{CatalogId, ObjectId};

/// A saved source, owned by the registry and shared with callers.
///
/// The mutex is held only for the duration of one cache operation; the
/// session model keeps those sequential, so contention is limited to
/// invalidation callbacks flipping flags.
#[derive(Debug)]
pub struct SavedSource {
    inner: Mutex<PlanSource>,
}

impl SavedSource {
    fn new(source: PlanSource) -> Self {
        Self {
            inner: Mutex::new(source),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PlanSource> {
        self.inner.lock()
    }

    /// Whether the source's tree is currently trustworthy.
    pub fn is_valid(&self) -> bool {
        self.inner.lock().is_valid()
    }

    /// Current plan generation of the source.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation()
    }

    /// Runs `f` against the source under its lock.
    pub fn with_source<R>(&self, f: impl FnOnce(&PlanSource) -> R) -> R {
        f(&self.inner.lock())
    }
}

/// Registry of every saved source of one session (or process, if shared
/// behind an `Arc`).
#[derive(Debug, Default)]
pub struct PlanStore {
    entries: Mutex<Vec<Arc<SavedSource>>>,
}

impl PlanStore {
    fn insert(&self, entry: Arc<SavedSource>) {
        self.entries.lock().push(entry);
    }

    fn remove(&self, entry: &Arc<SavedSource>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|candidate| !Arc::ptr_eq(candidate, entry));
        entries.len() != before
    }

    fn for_each(&self, mut f: impl FnMut(&Arc<SavedSource>)) {
        for entry in self.entries.lock().iter() {
            f(entry);
        }
    }

    /// Number of saved sources.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing has been saved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    lookups: AtomicU64,
    generic_hits: AtomicU64,
    generic_builds: AtomicU64,
    custom_builds: AtomicU64,
    invalidations: AtomicU64,
    resets: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Acquire calls served.
    pub lookups: u64,
    /// Acquires satisfied by an already-linked generic plan.
    pub generic_hits: u64,
    /// Generic plans built.
    pub generic_builds: u64,
    /// Custom plans built.
    pub custom_builds: u64,
    /// Sources or plans flipped invalid by targeted notifications.
    pub invalidations: u64,
    /// Untargeted reset sweeps processed.
    pub resets: u64,
    /// Saved sources currently registered.
    pub saved_sources: usize,
}

/// Session facade over the plan cache.
///
/// Owns the saved-source registry and the `Arc<dyn ...>` collaborator
/// services; every caller-facing operation goes through here.
pub struct PlanCache {
    compiler: Arc<dyn QueryCompiler>,
    catalog: Arc<dyn CatalogService>,
    config: CacheConfig,
    store: PlanStore,
    counters: StoreCounters,
}

impl PlanCache {
    /// Builds a cache with default policy settings.
    pub fn new(compiler: Arc<dyn QueryCompiler>, catalog: Arc<dyn CatalogService>) -> Self {
        Self::with_config(compiler, catalog, CacheConfig::default())
    }

    /// Builds a cache with explicit policy settings.
    pub fn with_config(
        compiler: Arc<dyn QueryCompiler>,
        catalog: Arc<dyn CatalogService>,
        config: CacheConfig,
    ) -> Self {
        Self {
            compiler,
            catalog,
            config,
            store: PlanStore::default(),
            counters: StoreCounters::default(),
        }
    }

    pub(crate) fn compiler(&self) -> &dyn QueryCompiler {
        &*self.compiler
    }

    pub(crate) fn catalog(&self) -> &dyn CatalogService {
        &*self.catalog
    }

    /// The saved-source registry.
    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    /// Begins a new reusable source from raw parser output. The inputs are
    /// captured by value; the caller's working state can be discarded.
    pub fn create(&self, text: impl Into<String>, raw: RawStatement) -> PlanSourceBuilder {
        PlanSourceBuilder::new(text.into(), raw, false)
    }

    /// Begins a one-shot source: single use inside the current transaction,
    /// never saved, never copied, never invalidated.
    pub fn create_oneshot(&self, text: impl Into<String>, raw: RawStatement) -> PlanSourceBuilder {
        PlanSourceBuilder::new(text.into(), raw, true)
    }

    /// Finishes a source: attaches the analyzed statement list, extracts
    /// its dependency snapshot, and records the parameter signature and
    /// planner options.
    pub fn complete(
        &self,
        builder: PlanSourceBuilder,
        queries: Vec<QueryTree>,
        param_spec: ParamSpec,
        options: CursorOptions,
        fixed_result: bool,
    ) -> Result<PlanSource> {
        builder.complete(
            self.compiler(),
            self.catalog(),
            queries,
            param_spec,
            options,
            fixed_result,
        )
    }

    /// Moves a source into the long-lived registry so it survives past the
    /// creating transaction and participates in invalidation.
    ///
    /// Any already-built generic plan is discarded: its ownership context
    /// is about to change and cannot be assumed long-lived. One-shot
    /// sources cannot be saved.
    pub fn save(&self, mut source: PlanSource) -> Result<Arc<SavedSource>> {
        if source.is_oneshot() {
            return Err(PlanCacheError::Unsupported(
                "cannot save a one-shot plan source",
            ));
        }
        source.unlink_plan();
        source.saved = true;
        debug!(text = %source.text(), "saving plan source");
        let entry = Arc::new(SavedSource::new(source));
        self.store.insert(Arc::clone(&entry));
        Ok(entry)
    }

    /// Unregisters a saved source. Its linked plan is unlinked but lives on
    /// until the last caller handle drops.
    pub fn drop_saved(&self, entry: &Arc<SavedSource>) {
        self.store.remove(entry);
        let mut source = entry.lock();
        source.saved = false;
        source.unlink_plan();
        debug!(text = %source.text(), "dropped plan source");
    }

    /// Copies an unsaved or saved source into an independent, unsaved one
    /// with the same tree, dependencies, and statistics but no linked plan.
    pub fn copy_source(&self, source: &PlanSource) -> Result<PlanSource> {
        source.duplicate()
    }

    /// [`PlanCache::copy_source`] for a saved entry.
    pub fn copy_saved(&self, entry: &SavedSource) -> Result<PlanSource> {
        entry.lock().duplicate()
    }

    /// Whether the source's tree is currently trustworthy. Race-free only
    /// under execution locks; `acquire` does the locked recheck.
    pub fn is_valid(&self, source: &PlanSource) -> bool {
        source.is_valid()
    }

    /// Result row shape of the statement, revalidated first so the answer
    /// reflects the present catalog state. `None` for statements that
    /// return no tuples (a property invalidation cannot change).
    pub fn result_shape(&self, source: &mut PlanSource) -> Result<Option<RowShape>> {
        if source.result_shape().is_none() {
            return Ok(None);
        }
        self.revalidate(source)?;
        Ok(source.result_shape().cloned())
    }

    /// Returns an executable plan for the source, building one if nothing
    /// usable is linked. The caller does not learn whether the plan is
    /// generic or custom. On return the plan is valid, execution locks are
    /// held, and the handle keeps the plan alive until dropped.
    pub fn acquire(
        &self,
        source: &mut PlanSource,
        params: Option<&BoundParams>,
    ) -> Result<PlanHandle> {
        self.acquire_inner(source, params)
    }

    /// [`PlanCache::acquire`] for a saved entry.
    pub fn acquire_saved(
        &self,
        entry: &SavedSource,
        params: Option<&BoundParams>,
    ) -> Result<PlanHandle> {
        let mut source = entry.lock();
        self.acquire_inner(&mut source, params)
    }

    /// Releases a plan handle. Equivalent to dropping it; the plan is
    /// destroyed once no handle references it and no source links it.
    pub fn release(&self, handle: PlanHandle) {
        drop(handle);
    }

    fn acquire_inner(
        &self,
        source: &mut PlanSource,
        params: Option<&BoundParams>,
    ) -> Result<PlanHandle> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        // Revalidate first: locks for planning are held afterwards, and the
        // returned transient tree spares the build a copy.
        let mut reanalyzed = self.revalidate(source)?;

        let mut custom = choose_custom(source, params, &self.config);

        if !custom {
            if let Some(plan) = self.check_generic_plan(source) {
                self.counters.generic_hits.fetch_add(1, Ordering::Relaxed);
                debug!(generation = plan.generation(), "reusing generic plan");
                return Ok(PlanHandle::new(plan));
            }

            // Build a fresh generic plan and link it.
            source.unlink_plan();
            let plan = self.build_plan(source, reanalyzed.take(), None)?;
            source.generic_cost = Some(plan.total_cost());
            source.link_generic(Arc::clone(&plan));
            self.counters.generic_builds.fetch_add(1, Ordering::Relaxed);
            debug!(
                generation = plan.generation(),
                cost = plan.total_cost(),
                "generic plan built"
            );

            // Now that the generic cost is known, the decision may flip: a
            // generic plan that would not have been chosen at this cost
            // must not be executed, only remembered.
            custom = choose_custom(source, params, &self.config);
            if !custom {
                source.valid = true;
                return Ok(PlanHandle::new(plan));
            }
        }

        // Custom build: replan against the bound values. Any previously
        // linked plan (including a just-built losing generic) is superseded.
        source.unlink_plan();
        let plan = self.build_plan(source, reanalyzed.take(), params)?;
        source.record_custom_cost(plan.total_cost());
        source.link_custom(Arc::clone(&plan));
        self.counters.custom_builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            generation = plan.generation(),
            cost = plan.total_cost(),
            "custom plan built"
        );
        source.valid = true;
        Ok(PlanHandle::new(plan))
    }

    /// Runs the optimizer for the source and wraps the result.
    ///
    /// Planning consumes the transient tree from revalidation when one is
    /// available; otherwise it works on a private copy, since the source's own
    /// tree must stay pristine for future rebuilds.
    fn build_plan(
        &self,
        source: &mut PlanSource,
        reanalyzed: Option<Vec<QueryTree>>,
        params: Option<&BoundParams>,
    ) -> Result<Arc<CompiledPlan>> {
        let queries = match reanalyzed {
            Some(queries) => queries,
            None => source.query_list.clone().unwrap_or_default(),
        };
        let statements = self.compiler.plan(&queries, source.options, params)?;

        // The optimizer can introduce dependencies of its own: a transient
        // statement pins the plan to the current visibility horizon, and
        // inlining can make the plan role-specific even when the rewrite
        // was not.
        let mut depends_on_role = source.deps.depends_on_role;
        let mut transient = false;
        for stmt in &statements {
            if stmt.kind != StatementKind::Query {
                continue;
            }
            transient |= stmt.transient;
            depends_on_role |= stmt.depends_on_role;
        }
        let transient_xmin = transient.then(|| self.catalog.transaction_xmin());

        let generation = source.bump_generation();
        Ok(Arc::new(CompiledPlan::new(
            statements,
            depends_on_role,
            self.catalog.current_role(),
            transient_xmin,
            generation,
        )))
    }

    /// Invalidates every saved source depending on `object`; `None` is the
    /// wildcard hitting every source with any relation dependency.
    pub fn invalidate_object(&self, object: Option<ObjectId>) {
        let mut hits = 0u64;
        self.store.for_each(|entry| {
            let mut source = entry.lock();
            if !source.is_valid() || source.is_transaction_control() {
                return;
            }
            if source.apply_object_change(object) {
                hits += 1;
            }
        });
        if hits > 0 {
            self.counters.invalidations.fetch_add(hits, Ordering::Relaxed);
            debug!(object = ?object, hits, "object change invalidated sources");
        }
    }

    /// Invalidates every saved source depending on the given catalog entry;
    /// a notified hash of 0 hits every tracked entry of that catalog.
    pub fn invalidate_catalog_entry(&self, catalog: CatalogId, hash: u64) {
        let mut hits = 0u64;
        self.store.for_each(|entry| {
            let mut source = entry.lock();
            if !source.is_valid() || source.is_transaction_control() {
                return;
            }
            if source.apply_catalog_change(catalog, hash) {
                hits += 1;
            }
        });
        if hits > 0 {
            self.counters.invalidations.fetch_add(hits, Ordering::Relaxed);
            debug!(catalog = %catalog, hash, hits, "catalog change invalidated sources");
        }
    }

    /// Invalidates every saved source unconditionally; used for catalogs
    /// too coarse-grained to track per entry. Transaction-control sources
    /// are exempt; they must stay executable even mid-abort.
    pub fn reset_all(&self) {
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
        self.store.for_each(|entry| {
            let mut source = entry.lock();
            if !source.is_valid() || source.is_transaction_control() {
                return;
            }
            source.apply_reset();
        });
        debug!("plan cache reset");
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            generic_hits: self.counters.generic_hits.load(Ordering::Relaxed),
            generic_builds: self.counters.generic_builds.load(Ordering::Relaxed),
            custom_builds: self.counters.custom_builds.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
            saved_sources: self.store.len(),
        }
    }
}

//! Cross-session shared plan store.
//!
//! Unlike the per-session store, entries here are read concurrently by many
//! sessions, so nothing mutates a published source or plan in place.
//! Invalidation flips a single atomic status flag; readers check status,
//! take their locks, and check again before trusting the plan. Reference
//! counts are atomic, and the periodic sweep (driven by an external
//! maintenance task) is the only thing that unpublishes entries, under its
//! own mutex so it never blocks active lookups beyond the map access
//! itself.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::cache::plan::CompiledPlan;
use crate::cache::source::PlanSource;
use crate::error::{PlanCacheError, Result};
use crate::provider::{CatalogService, LockMode};
use crate::tree::{ParamSpec, StatementKind};
use crate::types::{CatalogId, ObjectId};

/// Identity of a shared entry: statement text and parameter signature,
/// both collapsed to hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedKey {
    sql: u64,
    params: u64,
}

impl SharedKey {
    /// Keys the given statement text and parameter signature.
    pub fn for_statement(text: &str, params: &ParamSpec) -> Self {
        Self {
            sql: xxhash_rust::xxh64::xxh64(text.as_bytes(), 0),
            params: params.fingerprint(),
        }
    }
}

/// One published source plus its shared bookkeeping.
///
/// The source (and its linked generic plan) are immutable once published;
/// only the status flag and refcount ever change.
#[derive(Debug)]
pub struct SharedEntry {
    key: SharedKey,
    valid: AtomicBool,
    refs: AtomicU32,
    source: PlanSource,
}

impl SharedEntry {
    fn new(key: SharedKey, source: PlanSource) -> Self {
        Self {
            key,
            valid: AtomicBool::new(true),
            refs: AtomicU32::new(0),
            source,
        }
    }

    /// The entry's key.
    pub fn key(&self) -> SharedKey {
        self.key
    }

    /// Whether the entry is still servable.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Number of sessions currently attached.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// The published source (read-only).
    pub fn source(&self) -> &PlanSource {
        &self.source
    }

    fn generic_plan(&self) -> Option<&Arc<CompiledPlan>> {
        match self.source.linked_plan() {
            Some(linked) if linked.is_generic() => Some(linked.plan()),
            _ => None,
        }
    }

    fn depends_on_object(&self, object: Option<ObjectId>) -> bool {
        if self.source.deps.references_object(object) {
            return true;
        }
        self.generic_plan()
            .map(|plan| plan.references_object(object))
            .unwrap_or(false)
    }

    fn depends_on_catalog_entry(&self, catalog: CatalogId, hash: u64) -> bool {
        if self.source.deps.references_catalog_entry(catalog, hash) {
            return true;
        }
        self.generic_plan()
            .map(|plan| plan.references_catalog_entry(catalog, hash))
            .unwrap_or(false)
    }
}

/// A session's attachment to a shared entry.
///
/// Holds one atomic reference; dropping it is the detach. Relation locks
/// taken during attach belong to the session's transaction and are released
/// by transaction cleanup, not by this guard.
#[derive(Debug)]
pub struct SharedPlanGuard {
    entry: Arc<SharedEntry>,
}

impl SharedPlanGuard {
    /// The generic plan this attachment serves.
    pub fn plan(&self) -> &CompiledPlan {
        // Checked during attach; republishing never downgrades an entry.
        match self.entry.generic_plan() {
            Some(plan) => plan,
            None => {
                error!("shared entry lost its generic plan while attached");
                panic!("shared plan cache corrupted: attached entry has no generic plan");
            }
        }
    }

    /// The attached entry.
    pub fn entry(&self) -> &SharedEntry {
        &self.entry
    }
}

impl Drop for SharedPlanGuard {
    fn drop(&mut self) {
        let previous = self.entry.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "shared refcount underflow");
        if previous == 1 {
            // Last reference out; if the sweep already unpublished the
            // entry, the Arc drop below frees it exactly once.
            trace!("last shared plan reference released");
        }
    }
}

#[derive(Debug, Default)]
struct SharedCounters {
    publishes: AtomicU64,
    attach_hits: AtomicU64,
    attach_misses: AtomicU64,
    invalidations: AtomicU64,
    sweeps: AtomicU64,
    swept_entries: AtomicU64,
}

/// Point-in-time view of the shared store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStats {
    /// Entries published.
    pub publishes: u64,
    /// Attach calls that returned a plan.
    pub attach_hits: u64,
    /// Attach calls that found nothing servable.
    pub attach_misses: u64,
    /// Entries flipped invalid.
    pub invalidations: u64,
    /// Sweep passes run.
    pub sweeps: u64,
    /// Entries removed by sweeps.
    pub swept_entries: u64,
    /// Entries currently published.
    pub entries: usize,
}

/// The cross-session store itself.
pub struct SharedPlanStore {
    entries: RwLock<FxHashMap<SharedKey, Arc<SharedEntry>>>,
    sweep_lock: Mutex<()>,
    catalog: Arc<dyn CatalogService>,
    counters: SharedCounters,
}

impl SharedPlanStore {
    /// Builds an empty shared store over the given catalog service.
    pub fn new(catalog: Arc<dyn CatalogService>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            sweep_lock: Mutex::new(()),
            catalog,
            counters: SharedCounters::default(),
        }
    }

    /// Publishes a completed source for cross-session reuse.
    ///
    /// The source must carry a valid linked generic plan: shared entries
    /// always serve the generic plan, the choice policy never runs for
    /// them. If a valid entry already exists under the same key it wins and
    /// the new source is discarded.
    pub fn publish(&self, source: PlanSource) -> Result<Arc<SharedEntry>> {
        if source.is_oneshot() {
            return Err(PlanCacheError::Unsupported(
                "cannot publish a one-shot plan source",
            ));
        }
        if source.is_transaction_control() {
            return Err(PlanCacheError::Unsupported(
                "cannot publish a transaction control statement",
            ));
        }
        let has_generic = matches!(
            source.linked_plan(),
            Some(linked) if linked.is_generic() && linked.plan().is_valid()
        );
        if !has_generic {
            return Err(PlanCacheError::Unsupported(
                "shared plan source requires a valid generic plan",
            ));
        }

        let key = SharedKey::for_statement(source.text(), &source.param_spec);
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.is_valid() {
                return Ok(Arc::clone(existing));
            }
        }
        let entry = Arc::new(SharedEntry::new(key, source));
        entries.insert(key, Arc::clone(&entry));
        self.counters.publishes.fetch_add(1, Ordering::Relaxed);
        debug!(?key, "published shared plan");
        Ok(entry)
    }

    /// Attaches to the entry under `key`, if one is servable.
    ///
    /// Status is checked, execution locks are taken, and status is checked
    /// again: an invalidation that raced the lock acquisition is observed
    /// by the second check and the attach backs off.
    pub fn attach(&self, key: &SharedKey) -> Option<SharedPlanGuard> {
        let entry = {
            let entries = self.entries.read();
            entries.get(key).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.counters.attach_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !entry.is_valid() {
            self.counters.attach_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let plan = match entry.generic_plan() {
            Some(plan) => Arc::clone(plan),
            None => {
                // A valid shared entry without its generic plan means
                // another session corrupted the published state; nothing
                // local can recover that.
                error!(?key, "valid shared entry has no generic plan");
                panic!("shared plan cache corrupted: valid entry has no generic plan");
            }
        };

        let locks: Vec<(ObjectId, LockMode)> = plan
            .statements()
            .iter()
            .filter(|stmt| stmt.kind == StatementKind::Query)
            .flat_map(|stmt| stmt.relations.iter())
            .map(|rel| (rel.relation, LockMode::for_role(rel.role)))
            .collect();
        for (relation, mode) in &locks {
            self.catalog.lock(*relation, *mode);
        }

        if !entry.is_valid() {
            for (relation, mode) in &locks {
                self.catalog.unlock(*relation, *mode);
            }
            self.counters.attach_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.refs.fetch_add(1, Ordering::AcqRel);
        self.counters.attach_hits.fetch_add(1, Ordering::Relaxed);
        Some(SharedPlanGuard { entry })
    }

    /// Flips the status flag of every entry depending on `object`. The
    /// published source and plan are never touched; other sessions may be
    /// reading them right now.
    pub fn invalidate_object(&self, object: Option<ObjectId>) {
        let mut hits = 0u64;
        for entry in self.entries.read().values() {
            if entry.is_valid() && entry.depends_on_object(object) {
                entry.invalidate();
                hits += 1;
            }
        }
        if hits > 0 {
            self.counters.invalidations.fetch_add(hits, Ordering::Relaxed);
            debug!(object = ?object, hits, "object change invalidated shared entries");
        }
    }

    /// Flips the status flag of every entry depending on the given catalog
    /// entry.
    pub fn invalidate_catalog_entry(&self, catalog: CatalogId, hash: u64) {
        let mut hits = 0u64;
        for entry in self.entries.read().values() {
            if entry.is_valid() && entry.depends_on_catalog_entry(catalog, hash) {
                entry.invalidate();
                hits += 1;
            }
        }
        if hits > 0 {
            self.counters.invalidations.fetch_add(hits, Ordering::Relaxed);
            debug!(catalog = %catalog, hash, hits, "catalog change invalidated shared entries");
        }
    }

    /// Flips the status flag of every entry.
    pub fn reset_all(&self) {
        let mut hits = 0u64;
        for entry in self.entries.read().values() {
            if entry.is_valid() {
                entry.invalidate();
                hits += 1;
            }
        }
        self.counters.invalidations.fetch_add(hits, Ordering::Relaxed);
        debug!(hits, "shared plan store reset");
    }

    /// Unpublishes invalid entries no session is attached to. Returns the
    /// number removed.
    ///
    /// Runs under a dedicated mutex so concurrent sweeps serialize against
    /// each other without stalling attaches. The zero-refcount check uses a
    /// compare-exchange so an entry a session is racing to attach to stays
    /// published; the racer's status recheck then turns it away.
    pub fn sweep(&self) -> usize {
        let _sweep = self.sweep_lock.lock();
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.is_valid() {
                return true;
            }
            entry
                .refs
                .compare_exchange(0, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        });
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.counters
                .swept_entries
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept shared plan store");
        }
        removed
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the shared store counters.
    pub fn stats(&self) -> SharedStats {
        SharedStats {
            publishes: self.counters.publishes.load(Ordering::Relaxed),
            attach_hits: self.counters.attach_hits.load(Ordering::Relaxed),
            attach_misses: self.counters.attach_misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
            swept_entries: self.counters.swept_entries.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

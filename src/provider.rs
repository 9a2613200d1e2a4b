//! Traits the cache requires from the surrounding engine.
//!
//! The cache never parses, plans, or locks anything itself; it drives the
//! engine's compiler and catalog services through the traits below, held as
//! `Arc<dyn ...>` by the session facade.

use rustc_hash::FxHashSet;

use crate::error::Result;
use crate::tree::{
    visit, BoundParams, CatalogInvalItem, CursorOptions, ParamSpec, PlannedStatement, QueryTree,
    RawStatement, RelationRole,
};
use crate::types::{CatalogId, ObjectId, RoleId, TransactionId};

/// Lock strength taken on a relation before executing or replanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Plain read reference.
    SharedAccess,
    /// Row-marked reference (explicit row-lock clause).
    SharedRow,
    /// Write target.
    ExclusiveRow,
}

impl LockMode {
    /// Lock mode implied by how the statement references the relation.
    pub fn for_role(role: RelationRole) -> LockMode {
        match role {
            RelationRole::Result => LockMode::ExclusiveRow,
            RelationRole::RowMarked => LockMode::SharedRow,
            RelationRole::Referenced => LockMode::SharedAccess,
        }
    }
}

/// Snapshot of the name-resolution search path active when a statement was
/// analyzed. A different path can resolve the same name to a different
/// object, so a mismatch forces reanalysis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchPathSnapshot {
    /// Schema ids in resolution order.
    pub schemas: Vec<ObjectId>,
}

/// Dependencies surfaced while analyzing a statement list.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDependencies {
    /// Every relation the rewritten statements reference.
    pub relations: FxHashSet<ObjectId>,
    /// Catalog entries (functions, operators, ...) the rewrite consulted.
    pub inval_items: Vec<CatalogInvalItem>,
    /// The rewrite depended on role-specific state (row security).
    pub depends_on_role: bool,
    /// Statement shape makes a parameter-independent plan unsafe.
    pub forces_custom: bool,
}

/// The external parse-analysis/rewrite/optimize pipeline.
pub trait QueryCompiler: Send + Sync {
    /// Re-runs parse analysis and rewrite on a raw statement.
    ///
    /// Relation lookups performed here acquire the locks needed to plan the
    /// result safely; the cache relies on that side effect when rebuilding
    /// an invalidated tree.
    fn analyze_and_rewrite(
        &self,
        raw: &RawStatement,
        text: &str,
        params: &ParamSpec,
    ) -> Result<Vec<QueryTree>>;

    /// Runs the optimizer over an analyzed statement list.
    ///
    /// `params` of `None` asks for a parameter-independent plan; bound
    /// values produce a plan specialized to them.
    fn plan(
        &self,
        queries: &[QueryTree],
        options: CursorOptions,
        params: Option<&BoundParams>,
    ) -> Result<Vec<PlannedStatement>>;

    /// Collects the dependency set of an analyzed statement list.
    ///
    /// The default walks the trees for relation references; engines that
    /// track function inlining or row-security rewrites override this to
    /// report the extra items and flags.
    fn extract_dependencies(&self, queries: &[QueryTree]) -> ExtractedDependencies {
        let mut deps = ExtractedDependencies::default();
        for query in queries {
            visit::for_each_relation(query, &mut |rel| {
                deps.relations.insert(rel.relation);
            });
        }
        deps
    }
}

/// Catalog and lock-manager surface the validator drives.
pub trait CatalogService: Send + Sync {
    /// Acquires `mode` on `relation`. Blocking here (waiting out another
    /// session's conflicting lock) is the cache's only suspension point.
    fn lock(&self, relation: ObjectId, mode: LockMode);

    /// Releases a lock taken by [`CatalogService::lock`].
    ///
    /// The validator only ever releases locks it acquired in the same call,
    /// but the engine may already have discarded them at transaction
    /// cleanup; implementations must tolerate such a release.
    fn unlock(&self, relation: ObjectId, mode: LockMode);

    /// The currently active search path.
    fn current_search_path(&self) -> SearchPathSnapshot;

    /// Whether `snapshot` still matches the active search path.
    fn search_path_matches(&self, snapshot: &SearchPathSnapshot) -> bool {
        self.current_search_path() == *snapshot
    }

    /// The role the session currently runs as.
    fn current_role(&self) -> RoleId;

    /// The current transaction's visibility horizon; transient plans are
    /// pinned to it.
    fn transaction_xmin(&self) -> TransactionId;
}

/// Classes of catalog change the cache subscribes to at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Relation (table/index/view) definition changes.
    Relation,
    /// Function definition changes.
    Function,
    /// Any other catalog; tracked too coarsely for per-entry matching.
    Catalog,
}

/// A single catalog-change notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Invalidation {
    /// An object changed; `None` means "anything might have" and hits every
    /// source with any dependency at all.
    Object(Option<ObjectId>),
    /// A catalog entry changed; `hash` of 0 hits every tracked entry of the
    /// catalog.
    CatalogEntry {
        /// The catalog the entry lives in.
        catalog: CatalogId,
        /// Hash of the entry's lookup key.
        hash: u64,
    },
    /// Catalog changed in a way not tracked per entry; drop everything.
    Reset,
}

/// Callback registered with the engine's invalidation bus.
pub type InvalidationCallback = Box<dyn Fn(&Invalidation) + Send + Sync>;

/// The engine's catalog-change notification bus.
///
/// Notifications are delivered in the order the triggering catalog changes
/// become commit-visible.
pub trait InvalidationBus {
    /// Registers `callback` for changes to `class`.
    fn register(&self, class: ObjectClass, callback: InvalidationCallback);
}

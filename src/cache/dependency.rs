//! Dependency snapshot captured when a statement is analyzed.

use rustc_hash::FxHashSet;

use crate::provider::{ExtractedDependencies, SearchPathSnapshot};
use crate::types::{CatalogId, ObjectId, RoleId};
use crate::tree::CatalogInvalItem;

/// Everything a rewritten query tree's validity depends on: referenced
/// objects, consulted catalog entries, the search path active during
/// analysis, and the role the rewrite ran as.
///
/// Immutable once captured; a tree rebuild replaces the whole set.
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    /// Relations the rewritten statements reference.
    pub relations: FxHashSet<ObjectId>,
    /// Catalog entries the rewrite consulted.
    pub inval_items: Vec<CatalogInvalItem>,
    /// Search path active during analysis.
    pub search_path: SearchPathSnapshot,
    /// Role the rewrite ran as.
    pub rewrite_role: RoleId,
    /// The rewrite depended on role-specific state (row security).
    pub depends_on_role: bool,
    /// Statement shape makes a parameter-independent plan unsafe.
    pub forces_custom: bool,
}

impl DependencySet {
    /// Combines extracted dependencies with the catalog snapshots taken at
    /// the same moment.
    pub fn capture(
        extracted: ExtractedDependencies,
        search_path: SearchPathSnapshot,
        rewrite_role: RoleId,
    ) -> Self {
        Self {
            relations: extracted.relations,
            inval_items: extracted.inval_items,
            search_path,
            rewrite_role,
            depends_on_role: extracted.depends_on_role,
            forces_custom: extracted.forces_custom,
        }
    }

    /// True if a change to `object` affects this set. `None` is the
    /// wildcard: it hits any set with at least one relation dependency.
    pub fn references_object(&self, object: Option<ObjectId>) -> bool {
        match object {
            Some(id) => self.relations.contains(&id),
            None => !self.relations.is_empty(),
        }
    }

    /// True if a change to the given catalog entry affects this set.
    pub fn references_catalog_entry(&self, catalog: CatalogId, hash: u64) -> bool {
        self.inval_items
            .iter()
            .any(|item| item.matches(catalog, hash))
    }
}

//! Wiring between the engine's invalidation bus and the cache.
//!
//! Registered once at session startup: relation changes route to the
//! by-object scan, function changes to the by-catalog-entry scan, and every
//! other catalog falls back to a full reset; those catalogs are tracked too
//! coarsely to match per entry.

use std::sync::Arc;

use crate::cache::store::PlanCache;
use crate::provider::{Invalidation, InvalidationBus, ObjectClass};

impl PlanCache {
    /// Subscribes this cache to catalog-change notifications.
    ///
    /// Call once at startup. The callbacks hold a strong reference to the
    /// cache, so the bus keeps it alive until the bus itself goes away.
    pub fn register_callbacks(self: &Arc<Self>, bus: &dyn InvalidationBus) {
        let cache = Arc::clone(self);
        bus.register(
            ObjectClass::Relation,
            Box::new(move |event| {
                if let Invalidation::Object(object) = event {
                    cache.invalidate_object(*object);
                }
            }),
        );

        let cache = Arc::clone(self);
        bus.register(
            ObjectClass::Function,
            Box::new(move |event| {
                if let Invalidation::CatalogEntry { catalog, hash } = event {
                    cache.invalidate_catalog_entry(*catalog, *hash);
                }
            }),
        );

        let cache = Arc::clone(self);
        bus.register(ObjectClass::Catalog, Box::new(move |_| cache.reset_all()));
    }
}

//! Prepared-statement plan cache.
//!
//! For every prepared statement the cache holds a [`cache::PlanSource`]: the
//! raw statement, its analyzed-and-rewritten tree, and the dependency
//! snapshot the rewrite relied on. Executions go through
//! [`cache::PlanCache::acquire`], which revalidates the tree, decides
//! between reusing a parameter-independent (generic) plan and building one
//! specialized to the bound values (custom), and returns a reference-counted
//! [`cache::PlanHandle`]. Catalog changes arrive asynchronously over the
//! engine's invalidation bus and flip validity flags that the next acquire
//! observes.
//!
//! The parser, rewriter, optimizer, catalog, and lock manager are not part
//! of this crate; they are consumed through the traits in [`provider`].

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod provider;
pub mod tree;
pub mod types;

pub use cache::{
    CacheStats, CompiledPlan, PlanCache, PlanHandle, PlanSource, PlanSourceBuilder, SavedSource,
    SharedKey, SharedPlanStore,
};
pub use config::{CacheConfig, PlanMode};
pub use error::{PlanCacheError, Result};

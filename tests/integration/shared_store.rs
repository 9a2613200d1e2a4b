//! Cross-session shared store: publish/attach discipline, flag-only
//! invalidation, sweeping, and concurrent access.

mod common;

use std::sync::Arc;
use std::thread;

use common::Harness;
use plancache::cache::{SharedKey, SharedPlanStore};
use plancache::error::PlanCacheError;
use plancache::provider::CatalogService;
use plancache::tree::{ParamSpec, RelationRef};
use plancache::types::{CatalogId, ObjectId};
use plancache::PlanSource;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn shared_store(h: &Harness) -> SharedPlanStore {
    SharedPlanStore::new(Arc::clone(&h.catalog) as Arc<dyn CatalogService>)
}

/// A completed source with its generic plan built and linked.
fn publishable(h: &Harness, text: &str, relation: u32) -> PlanSource {
    let mut source = h.source(text, vec![RelationRef::read(ObjectId(relation))], ParamSpec::None);
    h.cache.acquire(&mut source, None).expect("build generic plan");
    source
}

#[test]
fn publish_requires_a_generic_plan() {
    let h = Harness::new();
    let store = shared_store(&h);

    let bare = h.source("select * from t", vec![RelationRef::read(ObjectId(1))], ParamSpec::None);
    assert!(matches!(
        store.publish(bare),
        Err(PlanCacheError::Unsupported(_))
    ));

    let ready = publishable(&h, "select * from t", 1);
    store.publish(ready).expect("publish");
    assert_eq!(store.len(), 1);
}

#[test]
fn attach_serves_the_published_plan() {
    let h = Harness::new();
    let store = shared_store(&h);
    let source = publishable(&h, "select * from t", 1);
    let key = SharedKey::for_statement(source.text(), &ParamSpec::None);
    store.publish(source).expect("publish");

    let guard = store.attach(&key).expect("attach");
    assert!(!guard.plan().statements().is_empty());
    assert_eq!(guard.entry().ref_count(), 1);

    let second = store.attach(&key).expect("second attach");
    assert_eq!(second.entry().ref_count(), 2);

    drop(guard);
    assert_eq!(second.entry().ref_count(), 1);
    drop(second);

    let stats = store.stats();
    assert_eq!(stats.attach_hits, 2);
}

#[test]
fn attach_misses_unknown_keys() {
    let h = Harness::new();
    let store = shared_store(&h);
    let key = SharedKey::for_statement("select nothing", &ParamSpec::None);
    assert!(store.attach(&key).is_none());
    assert_eq!(store.stats().attach_misses, 1);
}

#[test]
fn invalidation_flips_the_status_flag_only() {
    let h = Harness::new();
    let store = shared_store(&h);
    let source = publishable(&h, "select * from t", 1);
    let key = SharedKey::for_statement(source.text(), &ParamSpec::None);
    let entry = store.publish(source).expect("publish");

    store.invalidate_object(Some(ObjectId(1)));
    assert!(!entry.is_valid());
    assert!(store.attach(&key).is_none(), "invalid entries are not served");

    // The published tree and plan themselves were never touched; another
    // session may still be executing them.
    let linked = entry.source().linked_plan().expect("still linked");
    assert!(linked.plan().is_valid());
}

#[test]
fn unrelated_changes_leave_entries_servable() {
    let h = Harness::new();
    let store = shared_store(&h);
    let source = publishable(&h, "select * from t", 1);
    let key = SharedKey::for_statement(source.text(), &ParamSpec::None);
    store.publish(source).expect("publish");

    store.invalidate_object(Some(ObjectId(2)));
    store.invalidate_catalog_entry(CatalogId(7), 1);
    assert!(store.attach(&key).is_some());
}

#[test]
fn sweep_removes_only_invalid_unreferenced_entries() {
    let h = Harness::new();
    let store = shared_store(&h);

    let alive = publishable(&h, "select * from t", 1);
    let alive_key = SharedKey::for_statement(alive.text(), &ParamSpec::None);
    store.publish(alive).expect("publish alive");

    let doomed = publishable(&h, "select * from u", 2);
    let doomed_key = SharedKey::for_statement(doomed.text(), &ParamSpec::None);
    store.publish(doomed).expect("publish doomed");

    let pinned = publishable(&h, "select * from v", 3);
    let pinned_key = SharedKey::for_statement(pinned.text(), &ParamSpec::None);
    store.publish(pinned).expect("publish pinned");
    let pin = store.attach(&pinned_key).expect("attach pinned");

    store.invalidate_object(Some(ObjectId(2)));
    store.invalidate_object(Some(ObjectId(3)));

    assert_eq!(store.sweep(), 1, "only the unreferenced invalid entry goes");
    assert!(store.attach(&alive_key).is_some());
    assert!(store.attach(&doomed_key).is_none());

    // Once the last session detaches, the next sweep collects it.
    drop(pin);
    assert_eq!(store.sweep(), 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn reset_invalidates_every_entry() {
    let h = Harness::new();
    let store = shared_store(&h);
    for (text, relation) in [("select * from t", 1), ("select * from u", 2)] {
        store
            .publish(publishable(&h, text, relation))
            .expect("publish");
    }

    store.reset_all();
    assert_eq!(store.stats().invalidations, 2);
    assert_eq!(store.sweep(), 2);
    assert!(store.is_empty());
}

#[test]
fn republishing_a_valid_key_returns_the_existing_entry() {
    let h = Harness::new();
    let store = shared_store(&h);

    let first = store
        .publish(publishable(&h, "select * from t", 1))
        .expect("publish");
    let second = store
        .publish(publishable(&h, "select * from t", 1))
        .expect("republish");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.len(), 1);

    // After invalidation a republish replaces the dead entry.
    store.invalidate_object(Some(ObjectId(1)));
    let third = store
        .publish(publishable(&h, "select * from t", 1))
        .expect("replace");
    assert!(!Arc::ptr_eq(&first, &third));
    assert!(third.is_valid());
}

#[test]
fn concurrent_attach_invalidate_and_sweep() {
    let h = Harness::new();
    let store = Arc::new(shared_store(&h));

    let mut keys = Vec::new();
    for i in 0..8u32 {
        let text = format!("select * from t{i}");
        let source = publishable(&h, &text, i + 1);
        keys.push(SharedKey::for_statement(source.text(), &ParamSpec::None));
        store.publish(source).expect("publish");
    }
    let keys = Arc::new(keys);

    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let store = Arc::clone(&store);
        let keys = Arc::clone(&keys);
        handles.push(thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + worker);
            for _ in 0..500 {
                let key = keys[rng.gen_range(0..keys.len())];
                if let Some(guard) = store.attach(&key) {
                    // Attached plans are always servable generics.
                    assert!(guard.entry().ref_count() >= 1);
                    let _ = guard.plan().total_cost();
                }
            }
        }));
    }

    let invalidator = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut rng = ChaCha8Rng::seed_from_u64(0xBEEF);
            for _ in 0..200 {
                store.invalidate_object(Some(ObjectId(rng.gen_range(1..9))));
                if rng.gen_bool(0.25) {
                    store.sweep();
                }
            }
        })
    };

    for handle in handles {
        handle.join().expect("worker");
    }
    invalidator.join().expect("invalidator");

    // Everything is invalid by now; with all guards dropped the store
    // drains completely.
    store.reset_all();
    store.sweep();
    assert!(store.is_empty());
    for entry_key in keys.iter() {
        assert!(store.attach(entry_key).is_none());
    }
}

//! End-to-end lifecycle and plan-choice scenarios.

mod common;

use common::{bound, int_param_spec, Harness};
use plancache::error::PlanCacheError;
use plancache::tree::{
    Column, CursorOptions, ParamSpec, QueryTree, RawStatement, RelationRef, StatementKind,
};
use plancache::types::{ObjectId, TypeId};

#[test]
fn parameterless_statement_reuses_generic_plan() {
    let h = Harness::new();
    let mut source = h.source("select 1", vec![RelationRef::read(ObjectId(1))], ParamSpec::None);

    let first = h.cache.acquire(&mut source, None).expect("first acquire");
    let second = h.cache.acquire(&mut source, None).expect("second acquire");

    assert!(first.shares_plan(&second), "same compiled plan both times");
    assert_eq!(first.generation(), second.generation());
    assert_eq!(source.generation(), 1, "one build total");

    let stats = h.cache.stats();
    assert_eq!(stats.generic_builds, 1);
    assert_eq!(stats.generic_hits, 1);
}

#[test]
fn bootstrap_builds_custom_plans_per_execution() {
    let h = Harness::new();
    let mut source = h.source(
        "select * from t where a = $1",
        vec![RelationRef::read(ObjectId(1))],
        int_param_spec(),
    );

    let params = bound(7);
    let mut generations = Vec::new();
    for _ in 0..4 {
        let handle = h.cache.acquire(&mut source, Some(&params)).expect("acquire");
        generations.push(handle.generation());
    }

    assert_eq!(generations, vec![1, 2, 3, 4], "every execution replans");
    assert_eq!(source.num_custom_plans(), 4);
    assert_eq!(h.cache.stats().custom_builds, 4);
}

#[test]
fn generic_plan_wins_once_costed_cheaper_than_customs() {
    let h = Harness::new();
    h.compiler.set_custom_cost(88.0);
    let mut source = h.source(
        "select * from t where a = $1",
        vec![RelationRef::read(ObjectId(1))],
        int_param_spec(),
    );
    let params = bound(7);

    // Five bootstrap customs: avg custom cost 88.
    for _ in 0..5 {
        h.cache.acquire(&mut source, Some(&params)).expect("bootstrap");
    }
    assert_eq!(source.num_custom_plans(), 5);
    assert_eq!(source.avg_custom_cost(), Some(88.0));

    // Generic cost still unknown: the comparison is lost, stay custom.
    let handle = h.cache.acquire(&mut source, Some(&params)).expect("acquire");
    assert_eq!(source.num_custom_plans(), 6);
    drop(handle);
    assert!(source.generic_cost().is_none());

    // A parameterless execution builds and costs the generic plan at 100:
    // dearer than 88 * 1.1, so parameterized executions keep replanning.
    h.compiler.set_generic_cost(100.0);
    h.cache.acquire(&mut source, None).expect("cost the generic plan");
    assert_eq!(source.generic_cost(), Some(100.0));
    let custom_before = h.cache.stats().custom_builds;
    h.cache.acquire(&mut source, Some(&params)).expect("still custom");
    assert_eq!(h.cache.stats().custom_builds, custom_before + 1);

    // Rebuilt cheaper, the generic plan now wins and is reused as-is.
    h.compiler.set_generic_cost(80.0);
    h.cache.acquire(&mut source, None).expect("rebuild generic");
    assert_eq!(source.generic_cost(), Some(80.0));
    let reused = h.cache.acquire(&mut source, Some(&params)).expect("generic now");
    assert_eq!(reused.generation(), source.generation());
    assert_eq!(
        h.cache.stats().custom_builds,
        custom_before + 1,
        "no further custom builds"
    );
}

#[test]
fn freshly_costed_generic_plan_is_discarded_when_it_loses() {
    let h = Harness::new();
    h.compiler.set_custom_cost(50.0);
    h.compiler.set_generic_cost(40.0);
    // The optimizer output references a relation the query tree never
    // mentions, so it can be invalidated without touching the tree.
    h.compiler
        .set_plan_relations(vec![RelationRef::read(ObjectId(99))]);
    let source = h.source(
        "select * from t where a = $1",
        vec![RelationRef::read(ObjectId(1))],
        int_param_spec(),
    );
    let entry = h.cache.save(source).expect("save");
    let params = bound(3);

    for _ in 0..5 {
        h.cache.acquire_saved(&entry, Some(&params)).expect("bootstrap");
    }
    // Cost the generic plan at 40: cheaper than avg 50 * 1.1, so the next
    // parameterized acquire would reuse it.
    h.cache.acquire_saved(&entry, None).expect("cost the generic plan");
    assert_eq!(entry.with_source(|s| s.generic_cost()), Some(40.0));

    // Knock out just the compiled plan, then make replanning expensive.
    h.cache.invalidate_object(Some(ObjectId(99)));
    assert!(entry.is_valid(), "only the plan depended on the object");
    h.compiler.set_generic_cost(500.0);

    let before = h.cache.stats();
    let handle = h.cache.acquire_saved(&entry, Some(&params)).expect("acquire");

    // The rebuilt generic plan costed 500, flipping the decision: it is
    // remembered but never executed, and a custom plan is returned.
    assert_eq!(handle.plan().total_cost(), 50.0, "custom plan executed");
    assert_eq!(entry.with_source(|s| s.generic_cost()), Some(500.0));
    let after = h.cache.stats();
    assert_eq!(after.generic_builds, before.generic_builds + 1);
    assert_eq!(after.custom_builds, before.custom_builds + 1);
}

#[test]
fn copy_matches_source_but_is_unsaved_and_unlinked() {
    let h = Harness::new();
    let mut source = h.source(
        "select * from t where a = $1",
        vec![RelationRef::read(ObjectId(4)), RelationRef::result(ObjectId(5))],
        int_param_spec(),
    );
    let params = bound(1);
    for _ in 0..3 {
        h.cache.acquire(&mut source, Some(&params)).expect("build stats");
    }

    let copy = h.cache.copy_source(&source).expect("copy");
    assert!(!copy.is_saved());
    assert!(copy.linked_plan().is_none());
    assert_eq!(copy.generation(), source.generation());
    assert_eq!(copy.num_custom_plans(), source.num_custom_plans());
    assert_eq!(copy.generic_cost(), source.generic_cost());
    assert_eq!(
        copy.dependencies().relations,
        source.dependencies().relations
    );
    assert_eq!(copy.result_shape(), source.result_shape());
}

#[test]
fn oneshot_sources_cannot_be_saved_or_copied() {
    let h = Harness::new();
    let tree = QueryTree::query(vec![RelationRef::read(ObjectId(1))]);
    h.compiler.script("delete from t", vec![tree.clone()]);
    let builder = h
        .cache
        .create_oneshot("delete from t", RawStatement::new(StatementKind::Query, "DELETE"));
    let mut source = h
        .cache
        .complete(builder, vec![tree], ParamSpec::None, CursorOptions::default(), false)
        .expect("complete oneshot");

    assert!(source.is_oneshot());
    assert!(matches!(
        h.cache.copy_source(&source),
        Err(PlanCacheError::Unsupported(_))
    ));

    // One-shot executions always replan.
    let first = h.cache.acquire(&mut source, None).expect("acquire");
    let second = h.cache.acquire(&mut source, None).expect("acquire again");
    assert!(!first.shares_plan(&second));

    assert!(matches!(
        h.cache.save(source),
        Err(PlanCacheError::Unsupported(_))
    ));
}

#[test]
fn saving_discards_prebuilt_generic_plan() {
    let h = Harness::new();
    let mut source = h.source("select 1", vec![RelationRef::read(ObjectId(1))], ParamSpec::None);
    h.cache.acquire(&mut source, None).expect("prebuild");
    assert!(source.linked_plan().is_some());

    let entry = h.cache.save(source).expect("save");
    entry.with_source(|source| {
        assert!(source.is_saved());
        assert!(source.linked_plan().is_none(), "generic plan discarded on save");
    });
    assert_eq!(h.cache.store().len(), 1);

    h.cache.drop_saved(&entry);
    assert!(h.cache.store().is_empty());
    assert!(!entry.with_source(|source| source.is_saved()));
}

#[test]
fn fixed_result_shape_drift_is_a_hard_error() {
    let h = Harness::new();
    let text = "select a from t";
    let tree = QueryTree::query(vec![RelationRef::read(ObjectId(1))])
        .with_columns(vec![Column::new("a", TypeId(23))]);
    h.compiler.script(text, vec![tree.clone()]);
    let builder = h
        .cache
        .create(text, RawStatement::new(StatementKind::Query, "SELECT"));
    let source = h
        .cache
        .complete(builder, vec![tree], ParamSpec::None, CursorOptions::default(), true)
        .expect("complete fixed-result source");
    let entry = h.cache.save(source).expect("save");

    // The column type changes underneath the statement.
    let drifted = QueryTree::query(vec![RelationRef::read(ObjectId(1))])
        .with_columns(vec![Column::new("a", TypeId(25))]);
    h.compiler.script(text, vec![drifted]);
    h.cache.invalidate_object(Some(ObjectId(1)));

    let err = h.cache.acquire_saved(&entry, None).expect_err("shape drift");
    assert!(matches!(err, PlanCacheError::ResultShapeChanged));
    assert!(!entry.is_valid(), "source left invalid, not partially updated");
}

#[test]
fn flexible_result_shape_is_adopted_on_rebuild() {
    let h = Harness::new();
    let text = "select a from t";
    let source = h.source(text, vec![RelationRef::read(ObjectId(1))], ParamSpec::None);
    let original_shape = source.result_shape().cloned();

    let drifted = QueryTree::query(vec![RelationRef::read(ObjectId(1))])
        .with_columns(vec![Column::new("a", TypeId(1700))]);
    h.compiler.script(text, vec![drifted]);
    let entry = h.cache.save(source).expect("save");
    h.cache.invalidate_object(Some(ObjectId(1)));

    h.cache.acquire_saved(&entry, None).expect("rebuild adopts shape");
    entry.with_source(|source| {
        assert_ne!(source.result_shape().cloned(), original_shape);
    });
}

#[test]
fn empty_statement_is_permanently_valid() {
    let h = Harness::new();
    let builder = h.cache.create("", RawStatement::empty());
    let source = h
        .cache
        .complete(builder, Vec::new(), ParamSpec::None, CursorOptions::default(), false)
        .expect("complete empty source");
    let entry = h.cache.save(source).expect("save");

    let handle = h.cache.acquire_saved(&entry, None).expect("acquire");
    assert!(handle.statements().is_empty());

    h.cache.reset_all();
    assert!(entry.is_valid(), "nothing in an empty statement can go stale");
    h.cache.acquire_saved(&entry, None).expect("still acquirable");
}

#[test]
fn release_is_dropping_the_handle() {
    let h = Harness::new();
    let mut source = h.source("select 1", vec![RelationRef::read(ObjectId(1))], ParamSpec::None);
    let handle = h.cache.acquire(&mut source, None).expect("acquire");
    h.cache.release(handle);
    assert!(h.cache.is_valid(&source));
}

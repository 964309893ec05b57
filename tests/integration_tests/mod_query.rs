use super::support::{NS, SET, cluster, people, seed_people};
use binquery::metadata::IndexType;
use binquery::qualifier::FilterOperation;
use binquery::query::PlanKind;
use binquery::store::Digest;
use binquery::{KeyRecord, NativeFilter, QueryError, QueryPlan, Qualifier};
use bson::Bson;

fn collect(it: binquery::ResultIterator) -> Vec<KeyRecord> {
    it.map(|r| r.unwrap()).collect()
}

fn ages(records: &[KeyRecord]) -> Vec<i64> {
    let mut v: Vec<i64> = records.iter().map(|r| r.record.bins.get_i64("age").unwrap()).collect();
    v.sort_unstable();
    v
}

#[test]
fn indexed_age_is_pushed_down_and_color_compiled() {
    let (store, engine) = cluster();
    store.create_index(NS, Some(SET), "age", "age_idx", IndexType::Numeric).unwrap();
    engine.refresh_indexes();
    seed_people(&engine, 12);

    let quals = [Qualifier::eq("color", "blue").unwrap(), Qualifier::eq("age", 28).unwrap()];
    match engine.explain(&people(), &quals).unwrap() {
        QueryPlan::NativeFilterPlusProgram { statement, program } => {
            assert_eq!(
                statement.filter,
                Some(NativeFilter::Equal { bin: "age".into(), value: Bson::Int64(28) })
            );
            assert_eq!(program.as_str(), "if color == 'blue' then selectedRec = true end");
        }
        other => panic!("unexpected plan: {other:?}"),
    }

    let found = collect(engine.select(NS, Some(SET), None, &quals).unwrap());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key.user_key, Some(Bson::String("user:8".into())));
    assert_eq!(found[0].record.bins.get_str("color").unwrap(), "blue");
    assert_eq!(store.stats().aggregate_queries, 1);
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn between_without_index_scans_with_program() {
    let (store, engine) = cluster();
    seed_people(&engine, 20);
    let quals = [Qualifier::between("age", 25, 29).unwrap()];
    let plan = engine.explain(&people(), &quals).unwrap();
    assert_eq!(plan.kind(), PlanKind::ProgramOnly);
    assert_eq!(
        plan.program().map(|p| p.as_str()),
        Some("if age >= 25 and age <= 29 then selectedRec = true end")
    );

    let found = collect(engine.select(NS, Some(SET), None, &quals).unwrap());
    assert_eq!(ages(&found), vec![25, 26, 27, 28, 29]);
    assert_eq!(store.stats().scans, 0);
}

#[test]
fn key_lookup_hits_and_misses_without_scanning() {
    let (store, engine) = cluster();
    seed_people(&engine, 5);
    let before = store.stats();

    let hit = collect(engine.select(NS, Some(SET), None, &[Qualifier::key("user:3")]).unwrap());
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].record.bins.get_i64("age").unwrap(), 23);

    let miss = collect(engine.select(NS, Some(SET), None, &[Qualifier::key("user:42")]).unwrap());
    assert!(miss.is_empty());

    let after = store.stats();
    assert_eq!(after.point_reads - before.point_reads, 2);
    assert_eq!(after.scans, before.scans);
    assert_eq!(after.aggregate_queries, before.aggregate_queries);
}

#[test]
fn digest_lookup_addresses_the_same_record() {
    let (_, engine) = cluster();
    seed_people(&engine, 3);
    let digest = Digest::compute(Some(SET), &Bson::String("user:1".into())).unwrap();
    let found = collect(engine.select(NS, Some(SET), None, &[Qualifier::digest(digest)]).unwrap());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key.digest, digest);
}

#[test]
fn key_with_generation_check() {
    let (_, engine) = cluster();
    seed_people(&engine, 2);
    let at_one = [Qualifier::key("user:0"), Qualifier::generation(FilterOperation::Eq, 1).unwrap()];
    assert_eq!(collect(engine.select(NS, Some(SET), None, &at_one).unwrap()).len(), 1);
    let at_two = [Qualifier::key("user:0"), Qualifier::generation(FilterOperation::Gt, 1).unwrap()];
    assert!(collect(engine.select(NS, Some(SET), None, &at_two).unwrap()).is_empty());
}

#[test]
fn invalid_combinations_fail_before_any_store_call() {
    let (store, engine) = cluster();
    let before = store.stats();
    let two_keys = [Qualifier::key("a"), Qualifier::key("b")];
    assert!(matches!(
        engine.select(NS, Some(SET), None, &two_keys),
        Err(QueryError::InvalidQualifierCombination(_))
    ));
    let mixed = [Qualifier::key("a"), Qualifier::eq("color", "blue").unwrap()];
    assert!(matches!(
        engine.select(NS, Some(SET), None, &mixed),
        Err(QueryError::InvalidQualifierCombination(_))
    ));
    let mismatched = [Qualifier::between("age", 1, "z").unwrap()];
    assert!(matches!(
        engine.select(NS, Some(SET), None, &mismatched),
        Err(QueryError::UnsupportedQualifier(_))
    ));
    assert_eq!(store.stats(), before);
}

#[test]
fn string_operators_through_the_store() {
    let (_, engine) = cluster();
    seed_people(&engine, 12);
    let prefix = [Qualifier::field("name", FilterOperation::StartWith, "person 1").unwrap()];
    let found = collect(engine.select(NS, Some(SET), None, &prefix).unwrap());
    assert_eq!(ages(&found), vec![21, 30, 31]);

    let suffix = [Qualifier::field("name", FilterOperation::EndsWith, "1").unwrap()];
    let found = collect(engine.select(NS, Some(SET), None, &suffix).unwrap());
    assert_eq!(ages(&found), vec![21, 31]);

    // empty suffix selects everything
    let empty = [Qualifier::field("name", FilterOperation::EndsWith, "").unwrap()];
    assert_eq!(collect(engine.select(NS, Some(SET), None, &empty).unwrap()).len(), 12);

    let not_blue = [Qualifier::field("color", FilterOperation::NotEq, "blue").unwrap()];
    let found = collect(engine.select(NS, Some(SET), None, &not_blue).unwrap());
    assert!(found.iter().all(|r| r.record.bins.get_str("color").unwrap() == "red"));
    assert_eq!(found.len(), 6);
}

#[test]
fn caller_filter_disables_pushdown() {
    let (store, engine) = cluster();
    store.create_index(NS, Some(SET), "age", "age_idx", IndexType::Numeric).unwrap();
    store.create_index(NS, Some(SET), "color", "color_idx", IndexType::String).unwrap();
    engine.refresh_indexes();
    seed_people(&engine, 10);

    let filter = NativeFilter::Range { bin: "age".into(), begin: 20, end: 24 };
    let quals = [Qualifier::eq("color", "red").unwrap()];
    let found = collect(engine.select(NS, Some(SET), Some(filter), &quals).unwrap());
    assert_eq!(ages(&found), vec![21, 23]);
}

#[test]
fn early_close_releases_the_cursor() {
    let (store, engine) = cluster();
    seed_people(&engine, 10);
    let mut it = engine.select(NS, Some(SET), None, &[Qualifier::eq("color", "blue").unwrap()]).unwrap();
    assert!(it.has_next().unwrap());
    assert_eq!(store.open_cursors(), 1);
    it.close();
    it.close();
    assert_eq!(store.open_cursors(), 0);
    assert!(it.next().is_none());

    let it = engine.select(NS, Some(SET), None, &[]).unwrap();
    assert_eq!(store.open_cursors(), 1);
    drop(it);
    assert_eq!(store.open_cursors(), 0);
}

#[test]
fn unreachable_cluster_is_a_connection_error() {
    let (store, engine) = cluster();
    seed_people(&engine, 2);
    store.set_node_reachable("node-a", false);
    store.set_node_reachable("node-b", false);
    assert!(matches!(engine.select(NS, Some(SET), None, &[]), Err(QueryError::Connection(_))));
    assert!(matches!(
        engine.select(NS, Some(SET), None, &[Qualifier::key("user:0")]),
        Err(QueryError::Connection(_))
    ));
}

#[test]
fn deprecated_shapes_are_not_implemented() {
    let (_, engine) = cluster();
    assert!(matches!(
        engine.select_paged(&people(), 100, &[Qualifier::between("age", 1, 2).unwrap()]),
        Err(QueryError::FeatureNotImplemented(_))
    ));
    assert!(matches!(
        engine.select_with_program(&people(), "if age > 1 then selectedRec = true end"),
        Err(QueryError::FeatureNotImplemented(_))
    ));
}

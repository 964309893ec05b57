use super::support::{NS, SET, cluster, cluster_with, people, seed_people};
use binquery::metadata::IndexType;
use binquery::{Bin, EngineConfig, Key, QueryError, Qualifier};
use bson::Bson;
use std::sync::atomic::{AtomicBool, Ordering};

fn blue() -> Vec<Qualifier> {
    vec![Qualifier::eq("color", "blue").unwrap()]
}

fn count(engine: &binquery::QueryEngine, quals: &[Qualifier]) -> usize {
    engine.select(NS, Some(SET), None, quals).unwrap().count()
}

#[test]
fn update_writes_every_match() {
    let (_, engine) = cluster();
    seed_people(&engine, 10);
    let report = engine.update(&people(), &[Bin::new("status", "vip")], &blue()).unwrap();
    assert_eq!((report.read, report.write), (5, 5));
    assert_eq!(report.failed(), 0);
    assert_eq!(count(&engine, &[Qualifier::eq("status", "vip").unwrap()]), 5);
    let m = engine.metrics();
    assert_eq!(m.records_read, 5);
    assert_eq!(m.records_mutated, 5);
}

#[test]
fn concurrent_modification_is_excluded_from_write_count() {
    let (store, engine) = cluster();
    seed_people(&engine, 10);
    let fired = AtomicBool::new(false);
    store.set_write_hook(move |s, key| {
        if !fired.swap(true, Ordering::SeqCst) {
            s.touch(key).unwrap();
        }
    });
    let report = engine.update(&people(), &[Bin::new("status", "vip")], &blue()).unwrap();
    store.clear_write_hook();
    assert_eq!(report.read, 5);
    assert_eq!(report.write, 4);
    assert_eq!(report.failed(), 1);
    assert_eq!(count(&engine, &[Qualifier::eq("status", "vip").unwrap()]), 4);
    assert_eq!(engine.metrics().mutation_failures, 1);
}

#[test]
fn sole_key_update_is_blind() {
    let (store, engine) = cluster();
    seed_people(&engine, 2);
    let before = store.stats();
    let report = engine.update(&people(), &[Bin::new("age", 99_i64)], &[Qualifier::key("user:1")]).unwrap();
    assert_eq!((report.read, report.write), (1, 1));
    assert_eq!(store.stats().point_reads, before.point_reads);

    // the blind write creates a missing record
    engine.update(&people(), &[Bin::new("age", 1_i64)], &[Qualifier::key("ghost")]).unwrap();
    assert_eq!(count(&engine, &[Qualifier::key("ghost")]), 1);
}

#[test]
fn key_delete_reports_existence() {
    let (_, engine) = cluster();
    seed_people(&engine, 2);
    let hit = engine.delete(&people(), &[Qualifier::key("user:0")]).unwrap();
    assert_eq!((hit.read, hit.write), (1, 1));
    let miss = engine.delete(&people(), &[Qualifier::key("user:0")]).unwrap();
    assert_eq!((miss.read, miss.write), (1, 0));
}

#[test]
fn delete_by_index_and_program() {
    let (store, engine) = cluster();
    store.create_index(NS, Some(SET), "age", "age_idx", IndexType::Numeric).unwrap();
    engine.refresh_indexes();
    seed_people(&engine, 10);
    let quals = [Qualifier::between("age", 22, 27).unwrap(), Qualifier::eq("color", "red").unwrap()];
    let report = engine.delete(&people(), &quals).unwrap();
    assert_eq!((report.read, report.write), (3, 3));
    assert_eq!(store.record_count(NS), 7);
    assert_eq!(count(&engine, &quals), 0);
}

#[test]
fn empty_match_reports_zero() {
    let (_, engine) = cluster();
    seed_people(&engine, 4);
    let report = engine.delete(&people(), &[Qualifier::eq("color", "green").unwrap()]).unwrap();
    assert_eq!((report.read, report.write), (0, 0));
}

#[test]
fn parallel_update_keeps_per_record_accounting() {
    let config = EngineConfig { mutation_parallelism: 4, ..EngineConfig::default() };
    let (store, engine) = cluster_with(config);
    seed_people(&engine, 40);
    let fired = AtomicBool::new(false);
    store.set_write_hook(move |s, key| {
        if !fired.swap(true, Ordering::SeqCst) {
            s.touch(key).unwrap();
        }
    });
    let report = engine.update(&people(), &[Bin::new("status", "done")], &blue()).unwrap();
    store.clear_write_hook();
    assert_eq!(report.read, 20);
    assert_eq!(report.write, 19);
}

#[test]
fn connection_loss_aborts_the_batch() {
    let (store, engine) = cluster();
    seed_people(&engine, 10);
    let hook_store = store.clone();
    store.set_write_hook(move |_, _| {
        hook_store.set_node_reachable("node-a", false);
        hook_store.set_node_reachable("node-b", false);
    });
    let err = engine.update(&people(), &[Bin::new("status", "x")], &blue()).unwrap_err();
    assert!(matches!(err, QueryError::Connection(_)));
}

#[test]
fn insert_then_update_bumps_generation() {
    let (_, engine) = cluster();
    let key: Key = engine.insert(NS, Some(SET), "solo", &[Bin::new("color", "blue")]).unwrap();
    assert_eq!(key.user_key, Some(Bson::String("solo".into())));
    engine.update(&people(), &[Bin::new("n", 1)], &blue()).unwrap();
    let rec = engine.select(NS, Some(SET), None, &[Qualifier::key("solo")]).unwrap().next().unwrap().unwrap();
    assert_eq!(rec.record.generation, 2);
    assert_eq!(rec.record.bins.get_i32("n").unwrap(), 1);
}

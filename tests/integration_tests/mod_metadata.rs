use super::support::{NS, SET, cluster, seed_people};
use binquery::metadata::IndexType;
use binquery::query::FILTER_MODULE_SOURCE;
use binquery::store::memory::MemoryStore;
use binquery::qualifier::FilterOperation;
use binquery::{EngineConfig, Qualifier, QueryEngine, QueryError};
use std::sync::Arc;

#[test]
fn filter_module_registration_is_idempotent() {
    let (store, engine) = cluster();
    assert_eq!(store.stats().module_uploads, 1);
    for _ in 0..3 {
        engine.refresh_cluster().unwrap();
        engine.refresh_modules();
    }
    assert_eq!(store.stats().module_uploads, 1);
    let module = engine.module("as_utility").unwrap();
    assert_eq!(module.file_name, "as_utility.lua");
    assert_eq!(engine.module_source("as_utility").unwrap().as_deref(), Some(FILTER_MODULE_SOURCE));
}

#[test]
fn shipped_module_refuses_non_string_builtin_arguments() {
    assert!(FILTER_MODULE_SOURCE.contains("string = strict_string"));
    assert!(FILTER_MODULE_SOURCE.contains("type(s) ~= 'string'"));
}

#[test]
fn prefix_on_a_numeric_bin_selects_nothing() {
    let (_, engine) = cluster();
    seed_people(&engine, 12);
    let quals = [Qualifier::field("age", FilterOperation::StartWith, "2").unwrap()];
    assert_eq!(engine.select(NS, Some(SET), None, &quals).unwrap().count(), 0);
}

#[test]
fn engine_does_not_reupload_a_deployed_module() {
    let store = Arc::new(MemoryStore::new(&["n1"]).with_namespace(NS));
    {
        let first = QueryEngine::connect(store.clone()).unwrap();
        first.close();
    }
    let second = QueryEngine::connect(store.clone()).unwrap();
    assert!(second.module("as_utility").is_some());
    assert_eq!(store.stats().module_uploads, 1);
}

#[test]
fn registration_can_be_disabled() {
    let store = Arc::new(MemoryStore::new(&["n1"]).with_namespace(NS));
    let config = EngineConfig { register_filter_module: false, ..EngineConfig::default() };
    let engine = QueryEngine::new(store.clone(), config).unwrap();
    engine.refresh_cluster().unwrap();
    assert_eq!(store.stats().module_uploads, 0);
    let err = engine
        .select(NS, None, None, &[binquery::Qualifier::eq("a", 1).unwrap()])
        .unwrap_err();
    assert!(matches!(err, QueryError::Store(_)));
}

#[test]
fn refresh_skips_unreachable_nodes() {
    let (store, engine) = cluster();
    store.create_index(NS, Some(SET), "age", "age_idx", IndexType::Numeric).unwrap();
    store.set_node_reachable("node-a", false);
    let outcome = engine.refresh_indexes();
    assert_eq!(outcome.answered_by.as_deref(), Some("node-b"));
    assert_eq!(outcome.skipped, 1);
    let idx = engine.index("age").unwrap();
    assert_eq!(idx.index_name, "age_idx");
    assert_eq!(idx.index_type, IndexType::Numeric);
    assert!(engine.metrics().nodes_skipped >= 1);
}

#[test]
fn total_refresh_failure_keeps_previous_catalog() {
    let (store, engine) = cluster();
    store.create_index(NS, Some(SET), "age", "age_idx", IndexType::Numeric).unwrap();
    engine.refresh_indexes();
    assert!(engine.index("age").is_some());

    store.drop_index(NS, "age_idx");
    store.set_node_reachable("node-a", false);
    store.set_node_reachable("node-b", false);
    let outcome = engine.refresh_indexes();
    assert!(!outcome.refreshed());
    assert_eq!(outcome.skipped, 2);
    assert!(engine.index("age").is_some());

    store.set_node_reachable("node-a", true);
    engine.refresh_indexes();
    assert!(engine.index("age").is_none());
}

#[test]
fn namespaces_report_sets_and_objects() {
    let (_, engine) = cluster();
    seed_people(&engine, 6);
    engine.refresh_namespaces();
    let ns = engine.namespace(NS).unwrap();
    assert_eq!(ns.objects(), Some(6));
    assert_eq!(ns.set(SET).map(|s| s.objects), Some(6));
    assert!(engine.namespace("other").is_none());
}

#[test]
fn stale_index_cache_needs_explicit_refresh() {
    let (store, engine) = cluster();
    seed_people(&engine, 4);
    store.create_index(NS, Some(SET), "color", "color_idx", IndexType::String).unwrap();
    assert!(engine.index("color").is_none());
    engine.refresh_indexes();
    assert_eq!(engine.indexes().len(), 1);
    assert_eq!(engine.index("color").map(|i| i.set), Some(Some(SET.to_string())));
}

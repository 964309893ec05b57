use binquery::store::memory::MemoryStore;
use binquery::{Bin, EngineConfig, QueryEngine, Statement};
use std::sync::Arc;

pub const NS: &str = "test";
pub const SET: &str = "people";

/// Two-node cluster with the `test` namespace, connected engine on top.
pub fn cluster() -> (Arc<MemoryStore>, QueryEngine) {
    cluster_with(EngineConfig::default())
}

pub fn cluster_with(config: EngineConfig) -> (Arc<MemoryStore>, QueryEngine) {
    let store = Arc::new(MemoryStore::new(&["node-a", "node-b"]).with_namespace(NS));
    let engine = QueryEngine::new(store.clone(), config).unwrap();
    engine.refresh_cluster().unwrap();
    (store, engine)
}

/// `user:0` .. `user:{n-1}`; colors alternate blue/red, ages run 20, 21, ...
pub fn seed_people(engine: &QueryEngine, n: usize) {
    for i in 0..n {
        let color = if i % 2 == 0 { "blue" } else { "red" };
        let age = 20 + i64::try_from(i).unwrap();
        engine
            .insert(
                NS,
                Some(SET),
                format!("user:{i}"),
                &[Bin::new("color", color), Bin::new("age", age), Bin::new("name", format!("person {i}"))],
            )
            .unwrap();
    }
}

pub fn people() -> Statement {
    Statement::new(NS, Some(SET))
}

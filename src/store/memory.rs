//! In-process cluster implementing [`StoreClient`].
//!
//! Nodes share one record space, so every node reports identical metadata, as a healthy
//! cluster does. Nodes can be marked unreachable to exercise failover and connection
//! errors. Registered modules are stored verbatim; the aggregation entry point of the
//! filter module is executed natively through [`Script`].

use super::script::Script;
use super::{
    AggregateCall, Bin, Digest, GenerationPolicy, Key, KeyRecord, NativeFilter, Record,
    RecordCursor, RecordExistsAction, Statement, StoreClient, ValueCursor, WritePolicy,
};
use crate::errors::{QueryError, QueryResult};
use crate::metadata::IndexType;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document as BsonDocument, doc};
use parking_lot::RwLock;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Entry point of the filter module the store knows how to run.
pub const FILTER_FUNCTION: &str = "select_records";

/// Invoked before each client `put`/`delete` is applied, outside any store lock.
pub type WriteHook = Arc<dyn Fn(&MemoryStore, &Key) + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredRecord {
    set: Option<String>,
    user_key: Option<Bson>,
    bins: BsonDocument,
    generation: u32,
    expiration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum IndexKey {
    Int(i64),
    Str(String),
}

impl IndexKey {
    fn from_bin(kind: IndexType, v: &Bson) -> Option<Self> {
        match (kind, v) {
            (IndexType::Numeric, Bson::Int32(i)) => Some(Self::Int(i64::from(*i))),
            (IndexType::Numeric, Bson::Int64(i)) => Some(Self::Int(*i)),
            (IndexType::String, Bson::String(s)) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SecondaryIndex {
    namespace: String,
    set: Option<String>,
    bin: String,
    name: String,
    kind: IndexType,
    entries: BTreeMap<IndexKey, BTreeSet<Digest>>,
}

impl SecondaryIndex {
    fn covers(&self, namespace: &str, set: Option<&str>) -> bool {
        self.namespace == namespace && (self.set.is_none() || self.set.as_deref() == set)
    }

    fn insert(&mut self, digest: Digest, bins: &BsonDocument) {
        if let Some(k) = bins.get(&self.bin).and_then(|v| IndexKey::from_bin(self.kind, v)) {
            self.entries.entry(k).or_default().insert(digest);
        }
    }

    fn remove(&mut self, digest: Digest, bins: &BsonDocument) {
        if let Some(k) = bins.get(&self.bin).and_then(|v| IndexKey::from_bin(self.kind, v))
            && let Some(set) = self.entries.get_mut(&k)
        {
            set.remove(&digest);
            if set.is_empty() {
                self.entries.remove(&k);
            }
        }
    }

    fn lookup(&self, filter: &NativeFilter) -> Option<BTreeSet<Digest>> {
        match filter {
            NativeFilter::Equal { value, .. } => {
                let k = IndexKey::from_bin(self.kind, value)?;
                Some(self.entries.get(&k).cloned().unwrap_or_default())
            }
            NativeFilter::Range { begin, end, .. } => {
                if self.kind != IndexType::Numeric {
                    return None;
                }
                if begin > end {
                    return Some(BTreeSet::new());
                }
                let range = IndexKey::Int(*begin)..=IndexKey::Int(*end);
                Some(self.entries.range(range).flat_map(|(_, d)| d.iter().copied()).collect())
            }
        }
    }

    fn info_line(&self) -> String {
        format!(
            "ns={}:set={}:indexname={}:num_bins=1:bins={}:type={}:state=RW",
            self.namespace,
            self.set.as_deref().unwrap_or("NULL"),
            self.name,
            self.bin,
            self.kind
        )
    }
}

#[derive(Debug, Default)]
struct StoreState {
    namespaces: BTreeMap<String, BTreeMap<Digest, StoredRecord>>,
    indexes: Vec<SecondaryIndex>,
    modules: BTreeMap<String, String>,
}

impl StoreState {
    fn records(&self, namespace: &str) -> QueryResult<&BTreeMap<Digest, StoredRecord>> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| QueryError::Store(format!("namespace '{namespace}' not found")))
    }

    fn unindex(&mut self, namespace: &str, digest: Digest, rec: &StoredRecord) {
        for idx in self.indexes.iter_mut().filter(|i| i.covers(namespace, rec.set.as_deref())) {
            idx.remove(digest, &rec.bins);
        }
    }

    fn reindex(&mut self, namespace: &str, digest: Digest, rec: &StoredRecord) {
        for idx in self.indexes.iter_mut().filter(|i| i.covers(namespace, rec.set.as_deref())) {
            idx.insert(digest, &rec.bins);
        }
    }

    /// Digests the statement targets, in digest order.
    fn candidates(&self, stmt: &Statement) -> QueryResult<Vec<Digest>> {
        let records = self.records(&stmt.namespace)?;
        let digests: Vec<Digest> = match &stmt.filter {
            None => records.keys().copied().collect(),
            Some(filter) => {
                let idx = self
                    .indexes
                    .iter()
                    .find(|i| i.bin == filter.bin() && i.covers(&stmt.namespace, stmt.set.as_deref()))
                    .ok_or_else(|| {
                        QueryError::Store(format!("index not found for bin '{}'", filter.bin()))
                    })?;
                let hits = idx.lookup(filter).ok_or_else(|| {
                    QueryError::Store(format!(
                        "index '{}' of type {} cannot answer {filter:?}",
                        idx.name, idx.kind
                    ))
                })?;
                hits.into_iter().collect()
            }
        };
        Ok(digests
            .into_iter()
            .filter(|d| {
                records.get(d).is_some_and(|r| stmt.set.is_none() || r.set == stmt.set)
            })
            .collect())
    }
}

/// Counters of the calls the store has served.
#[derive(Debug, Default)]
struct Counters {
    point_reads: AtomicU64,
    scans: AtomicU64,
    aggregate_queries: AtomicU64,
    writes: AtomicU64,
    info_calls: AtomicU64,
    module_uploads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub point_reads: u64,
    pub scans: u64,
    pub aggregate_queries: u64,
    pub writes: u64,
    pub info_calls: u64,
    pub module_uploads: u64,
}

pub struct MemoryStore {
    nodes: RwLock<Vec<(String, bool)>>,
    state: RwLock<StoreState>,
    write_hook: RwLock<Option<WriteHook>>,
    counters: Counters,
    open_cursors: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("nodes", &*self.nodes.read())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// A cluster with the given node names, all reachable, and no namespaces.
    #[must_use]
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            nodes: RwLock::new(nodes.iter().map(|n| ((*n).to_string(), true)).collect()),
            state: RwLock::new(StoreState::default()),
            write_hook: RwLock::new(None),
            counters: Counters::default(),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_namespace(self, name: &str) -> Self {
        self.add_namespace(name);
        self
    }

    pub fn add_namespace(&self, name: &str) {
        self.state.write().namespaces.entry(name.to_string()).or_default();
    }

    /// Returns false for an unknown node.
    pub fn set_node_reachable(&self, node: &str, reachable: bool) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|(n, _)| n == node) {
            Some(entry) => {
                entry.1 = reachable;
                true
            }
            None => false,
        }
    }

    /// Builds a secondary index over existing records and keeps it current on writes.
    ///
    /// # Errors
    /// `Store` when the namespace is unknown, the name is taken, or the bin already has
    /// an index in that namespace.
    pub fn create_index(
        &self,
        namespace: &str,
        set: Option<&str>,
        bin: &str,
        name: &str,
        kind: IndexType,
    ) -> QueryResult<()> {
        let mut state = self.state.write();
        let records = state.records(namespace)?;
        if state.indexes.iter().any(|i| i.namespace == namespace && (i.name == name || i.bin == bin))
        {
            return Err(QueryError::Store(format!("index '{name}' on '{bin}' already exists")));
        }
        let mut idx = SecondaryIndex {
            namespace: namespace.to_string(),
            set: set.map(str::to_string),
            bin: bin.to_string(),
            name: name.to_string(),
            kind,
            entries: BTreeMap::new(),
        };
        for (digest, rec) in records {
            if idx.covers(namespace, rec.set.as_deref()) {
                idx.insert(*digest, &rec.bins);
            }
        }
        state.indexes.push(idx);
        Ok(())
    }

    /// Returns whether the index existed.
    pub fn drop_index(&self, namespace: &str, name: &str) -> bool {
        let mut state = self.state.write();
        let before = state.indexes.len();
        state.indexes.retain(|i| !(i.namespace == namespace && i.name == name));
        state.indexes.len() != before
    }

    /// Installs a hook run before every client write; replaces any previous hook.
    pub fn set_write_hook(&self, hook: impl Fn(&Self, &Key) + Send + Sync + 'static) {
        *self.write_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_write_hook(&self) {
        *self.write_hook.write() = None;
    }

    /// Bumps a record's generation without changing its bins, as a concurrent writer
    /// would. Bypasses the write hook.
    ///
    /// # Errors
    /// `RecordNotFound` when the record does not exist.
    pub fn touch(&self, key: &Key) -> QueryResult<u32> {
        let mut state = self.state.write();
        let rec = state
            .namespaces
            .get_mut(&key.namespace)
            .and_then(|ns| ns.get_mut(&key.digest))
            .ok_or_else(|| QueryError::RecordNotFound(key.to_string()))?;
        rec.generation = next_generation(rec.generation);
        Ok(rec.generation)
    }

    /// Number of records currently stored in the namespace.
    #[must_use]
    pub fn record_count(&self, namespace: &str) -> usize {
        self.state.read().namespaces.get(namespace).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            point_reads: c.point_reads.load(Ordering::Relaxed),
            scans: c.scans.load(Ordering::Relaxed),
            aggregate_queries: c.aggregate_queries.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            info_calls: c.info_calls.load(Ordering::Relaxed),
            module_uploads: c.module_uploads.load(Ordering::Relaxed),
        }
    }

    /// Cursors handed out and not yet closed or dropped.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> QueryResult<()> {
        if self.nodes.read().iter().any(|(_, up)| *up) {
            Ok(())
        } else {
            Err(QueryError::Connection("no reachable node in cluster".into()))
        }
    }

    fn run_write_hook(&self, key: &Key) {
        let hook = self.write_hook.read().clone();
        if let Some(hook) = hook {
            hook(self, key);
        }
    }

    fn cursor<T>(&self, items: VecDeque<T>) -> VecCursor<T> {
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        VecCursor { items, open: Some(Arc::clone(&self.open_cursors)) }
    }

    fn answer_info(&self, command: &str) -> String {
        let state = self.state.read();
        if command == "namespaces" {
            return state.namespaces.keys().cloned().collect::<Vec<_>>().join(";");
        }
        if command == "sindex" {
            return state.indexes.iter().map(SecondaryIndex::info_line).collect::<Vec<_>>().join(";");
        }
        if command == "udf-list" {
            return state
                .modules
                .iter()
                .map(|(file, src)| format!("filename={file},hash={},type=LUA;", source_hash(src)))
                .collect();
        }
        if let Some(ns) = command.strip_prefix("namespace/") {
            let Some(records) = state.namespaces.get(ns) else { return String::new() };
            let sets: BTreeSet<&str> = records.values().filter_map(|r| r.set.as_deref()).collect();
            return format!(
                "objects={};sets={};replication-factor=1;storage-engine=memory",
                records.len(),
                sets.len()
            );
        }
        if let Some(ns) = command.strip_prefix("sets/") {
            let Some(records) = state.namespaces.get(ns) else { return String::new() };
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for set in records.values().filter_map(|r| r.set.as_deref()) {
                *counts.entry(set).or_default() += 1;
            }
            return counts
                .into_iter()
                .map(|(set, n)| format!("ns={ns}:set={set}:objects={n}:deleting=false;"))
                .collect();
        }
        if let Some(file) = command.strip_prefix("udf-get:filename=") {
            return state.modules.get(file).map_or_else(
                || "error=not_found".to_string(),
                |src| format!("gen={};type=LUA;content={}", source_hash(src), B64.encode(src)),
            );
        }
        if command == "build" {
            return env!("CARGO_PKG_VERSION").to_string();
        }
        String::new()
    }
}

fn next_generation(g: u32) -> u32 {
    g.checked_add(1).unwrap_or(1)
}

fn source_hash(src: &str) -> String {
    let mut h = Sha256::new();
    h.update(src.as_bytes());
    hex::encode(&h.finalize()[..20])
}

fn project(bins: &BsonDocument, names: Option<&[String]>) -> BsonDocument {
    match names {
        None => bins.clone(),
        Some(names) => bins
            .iter()
            .filter(|(k, _)| names.iter().any(|n| n == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn key_of(namespace: &str, digest: Digest, rec: &StoredRecord) -> Key {
    Key {
        namespace: namespace.to_string(),
        set: rec.set.clone(),
        user_key: rec.user_key.clone(),
        digest,
    }
}

impl StoreClient for MemoryStore {
    fn node_names(&self) -> Vec<String> {
        self.nodes.read().iter().map(|(n, _)| n.clone()).collect()
    }

    fn info(&self, node: &str, command: &str) -> QueryResult<String> {
        let up = self
            .nodes
            .read()
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, up)| *up)
            .ok_or_else(|| QueryError::InvalidArgument(format!("unknown node '{node}'")))?;
        if !up {
            return Err(QueryError::Connection(format!("node {node} is unreachable")));
        }
        self.counters.info_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.answer_info(command))
    }

    fn get(&self, key: &Key, bins: Option<&[String]>) -> QueryResult<Option<Record>> {
        self.ensure_reachable()?;
        self.counters.point_reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state.records(&key.namespace)?.get(&key.digest).map(|r| Record {
            bins: project(&r.bins, bins),
            generation: r.generation,
            expiration: r.expiration,
        }))
    }

    fn get_header(&self, key: &Key) -> QueryResult<Option<Record>> {
        self.get(key, Some(&[]))
    }

    fn exists(&self, key: &Key) -> QueryResult<bool> {
        Ok(self.get_header(key)?.is_some())
    }

    fn get_batch(&self, keys: &[Key]) -> QueryResult<Vec<Option<Record>>> {
        keys.iter().map(|k| self.get(k, None)).collect()
    }

    fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> QueryResult<()> {
        self.ensure_reachable()?;
        self.run_write_hook(key);
        let mut state = self.state.write();
        let existing = state.records(&key.namespace)?.get(&key.digest).cloned();
        match (policy.exists, &existing) {
            (RecordExistsAction::UpdateOnly, None) => {
                return Err(QueryError::RecordNotFound(key.to_string()));
            }
            (RecordExistsAction::CreateOnly, Some(_)) => {
                return Err(QueryError::RecordExists(key.to_string()));
            }
            _ => {}
        }
        if let GenerationPolicy::ExpectEqual(expected) = policy.generation {
            let actual = existing.as_ref().map_or(0, |r| r.generation);
            if actual != expected {
                return Err(QueryError::GenerationConflict(key.to_string()));
            }
        }
        let mut rec = match (&existing, policy.exists) {
            (Some(r), RecordExistsAction::Replace) => StoredRecord { bins: BsonDocument::new(), ..r.clone() },
            (Some(r), _) => r.clone(),
            (None, _) => StoredRecord {
                set: key.set.clone(),
                user_key: None,
                bins: BsonDocument::new(),
                generation: 0,
                expiration: 0,
            },
        };
        for bin in bins {
            if bin.value == Bson::Null {
                rec.bins.remove(&bin.name);
            } else {
                rec.bins.insert(bin.name.clone(), bin.value.clone());
            }
        }
        if policy.send_key && key.user_key.is_some() {
            rec.user_key.clone_from(&key.user_key);
        }
        rec.generation = next_generation(rec.generation);
        if let Some(ttl) = policy.expiration {
            rec.expiration = ttl;
        }
        if let Some(old) = &existing {
            state.unindex(&key.namespace, key.digest, old);
        }
        if let Some(ns) = state.namespaces.get_mut(&key.namespace) {
            if rec.bins.is_empty() {
                ns.remove(&key.digest);
            } else {
                ns.insert(key.digest, rec.clone());
            }
        }
        if !rec.bins.is_empty() {
            state.reindex(&key.namespace, key.digest, &rec);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, policy: &WritePolicy, key: &Key) -> QueryResult<bool> {
        self.ensure_reachable()?;
        self.run_write_hook(key);
        let mut state = self.state.write();
        let Some(existing) = state.records(&key.namespace)?.get(&key.digest).cloned() else {
            return Ok(false);
        };
        if let GenerationPolicy::ExpectEqual(expected) = policy.generation
            && existing.generation != expected
        {
            return Err(QueryError::GenerationConflict(key.to_string()));
        }
        state.unindex(&key.namespace, key.digest, &existing);
        if let Some(ns) = state.namespaces.get_mut(&key.namespace) {
            ns.remove(&key.digest);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn query(&self, statement: &Statement) -> QueryResult<Box<dyn RecordCursor>> {
        self.ensure_reachable()?;
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        let records = state.records(&statement.namespace)?;
        let items: VecDeque<KeyRecord> = state
            .candidates(statement)?
            .into_iter()
            .filter_map(|d| records.get(&d).map(|r| (d, r)))
            .map(|(d, r)| KeyRecord {
                key: key_of(&statement.namespace, d, r),
                record: Record {
                    bins: if statement.include_bin_data {
                        project(&r.bins, statement.bin_names.as_deref())
                    } else {
                        BsonDocument::new()
                    },
                    generation: r.generation,
                    expiration: r.expiration,
                },
            })
            .collect();
        Ok(Box::new(self.cursor(items)))
    }

    fn query_aggregate(
        &self,
        statement: &Statement,
        call: &AggregateCall,
    ) -> QueryResult<Box<dyn ValueCursor>> {
        self.ensure_reachable()?;
        self.counters.aggregate_queries.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        let file = format!("{}.lua", call.module);
        if !state.modules.contains_key(&file) {
            return Err(QueryError::Store(format!("module '{}' is not registered", call.module)));
        }
        if call.function != FILTER_FUNCTION {
            return Err(QueryError::Store(format!(
                "function '{}' not found in module '{}'",
                call.function, call.module
            )));
        }
        let include_all = call.args.get_bool("includeAllFields").unwrap_or(false);
        let program = call
            .args
            .get_str("filterFuncStr")
            .map_err(|_| QueryError::Store("aggregation argument 'filterFuncStr' missing".into()))?;
        let script = Script::parse(program)?;
        let records = state.records(&statement.namespace)?;
        let mut items = VecDeque::new();
        for digest in state.candidates(statement)? {
            let Some(rec) = records.get(&digest) else { continue };
            match script.selects(&rec.bins) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::trace!("record {} not selected: {e}", digest);
                    continue;
                }
            }
            let mut out = doc! {
                "digest": Binary { subtype: BinarySubtype::Generic, bytes: digest.0.to_vec() },
                "generation": i64::from(rec.generation),
                "expiration": i64::from(rec.expiration),
            };
            if let Some(k) = &rec.user_key {
                out.insert("key", k.clone());
            }
            if include_all {
                out.insert("bins", project(&rec.bins, statement.bin_names.as_deref()));
            }
            items.push_back(Bson::Document(out));
        }
        Ok(Box::new(self.cursor(items)))
    }

    fn register_module(&self, file_name: &str, source: &str) -> QueryResult<()> {
        self.ensure_reachable()?;
        if !file_name.ends_with(".lua") {
            return Err(QueryError::Store(format!("module file '{file_name}' must end in .lua")));
        }
        self.state.write().modules.insert(file_name.to_string(), source.to_string());
        self.counters.module_uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Cursor over results materialised at query time.
struct VecCursor<T> {
    items: VecDeque<T>,
    open: Option<Arc<AtomicUsize>>,
}

impl<T> VecCursor<T> {
    fn pop(&mut self) -> Option<T> {
        if self.open.is_none() {
            return None;
        }
        self.items.pop_front()
    }

    fn release(&mut self) {
        self.items.clear();
        if let Some(open) = self.open.take() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T> Drop for VecCursor<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl RecordCursor for VecCursor<KeyRecord> {
    fn next_record(&mut self) -> QueryResult<Option<KeyRecord>> {
        Ok(self.pop())
    }

    fn close(&mut self) {
        self.release();
    }
}

impl ValueCursor for VecCursor<Bson> {
    fn next_value(&mut self) -> QueryResult<Option<Bson>> {
        Ok(self.pop())
    }

    fn close(&mut self) {
        self.release();
    }
}

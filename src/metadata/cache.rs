//! Cluster metadata cache.
//!
//! Three independent catalogs (indexes by bin, namespaces by name, modules by name).
//! Each is an `Arc`'d map replaced wholesale on refresh, so readers take a cheap
//! snapshot and never observe a half-built catalog. Refreshes of one catalog are
//! serialised by its own mutex; a failed refresh leaves the previous catalog in place.

use super::{
    IndexDescriptor, ModuleDescriptor, NamespaceDescriptor, parse_indexes, parse_modules,
    parse_namespace_names,
};
use crate::errors::QueryResult;
use crate::store::StoreClient;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Catalog<T> = Arc<BTreeMap<String, T>>;

struct Slot<T> {
    current: RwLock<Catalog<T>>,
    refresh: Mutex<()>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self { current: RwLock::new(Arc::new(BTreeMap::new())), refresh: Mutex::new(()) }
    }
}

impl<T: Clone> Slot<T> {
    fn snapshot(&self) -> Catalog<T> {
        Arc::clone(&self.current.read())
    }

    fn get(&self, name: &str) -> Option<T> {
        self.current.read().get(name).cloned()
    }

    fn replace(&self, map: BTreeMap<String, T>) {
        *self.current.write() = Arc::new(map);
    }

    fn clear(&self) {
        self.replace(BTreeMap::new());
    }
}

/// What a single catalog refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Node whose answer was used; `None` when no node answered.
    pub answered_by: Option<String>,
    /// Nodes tried and skipped before an answer (or all of them).
    pub skipped: usize,
    /// Catalog size after the refresh.
    pub entries: usize,
}

impl RefreshOutcome {
    #[must_use]
    pub const fn refreshed(&self) -> bool {
        self.answered_by.is_some()
    }
}

/// Asks each known node in turn and returns the first successful answer.
pub(crate) fn first_answer<T>(
    store: &dyn StoreClient,
    what: &str,
    mut fetch: impl FnMut(&str) -> QueryResult<T>,
) -> (Option<(String, T)>, usize) {
    let mut skipped = 0;
    for node in store.node_names() {
        match fetch(&node) {
            Ok(v) => return (Some((node, v)), skipped),
            Err(e) => {
                log::warn!("skipping node {node} during {what} refresh: {e}");
                skipped += 1;
            }
        }
    }
    (None, skipped)
}

#[derive(Default)]
pub struct MetadataCache {
    indexes: Slot<IndexDescriptor>,
    namespaces: Slot<NamespaceDescriptor>,
    modules: Slot<ModuleDescriptor>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("indexes", &self.indexes.snapshot().len())
            .field("namespaces", &self.namespaces.snapshot().len())
            .field("modules", &self.modules.snapshot().len())
            .finish()
    }
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_slot<T: Clone>(
        slot: &Slot<T>,
        store: &dyn StoreClient,
        what: &str,
        fetch: impl FnMut(&str) -> QueryResult<BTreeMap<String, T>>,
    ) -> RefreshOutcome {
        let _exclusive = slot.refresh.lock();
        let (answer, skipped) = first_answer(store, what, fetch);
        match answer {
            Some((node, map)) => {
                let entries = map.len();
                slot.replace(map);
                log::info!("{what} refreshed from {node}: {entries} entries");
                RefreshOutcome { answered_by: Some(node), skipped, entries }
            }
            None => {
                let entries = slot.snapshot().len();
                log::warn!("{what} refresh: no node answered, keeping {entries} cached entries");
                RefreshOutcome { answered_by: None, skipped, entries }
            }
        }
    }

    /// Reloads secondary indexes, keyed by bin name. A later record for the same bin
    /// replaces an earlier one.
    pub fn refresh_indexes(&self, store: &dyn StoreClient) -> RefreshOutcome {
        Self::refresh_slot(&self.indexes, store, "index", |node| {
            let text = store.info(node, "sindex")?;
            Ok(parse_indexes(&text).into_iter().map(|d| (d.bin_name.clone(), d)).collect())
        })
    }

    pub fn refresh_namespaces(&self, store: &dyn StoreClient) -> RefreshOutcome {
        Self::refresh_slot(&self.namespaces, store, "namespace", |node| {
            let names = parse_namespace_names(&store.info(node, "namespaces")?);
            let mut map = BTreeMap::new();
            for name in names {
                let detail = store.info(node, &format!("namespace/{name}"))?;
                let sets = store.info(node, &format!("sets/{name}"))?;
                map.insert(name.clone(), NamespaceDescriptor::from_info(&name, &detail, &sets));
            }
            Ok(map)
        })
    }

    pub fn refresh_modules(&self, store: &dyn StoreClient) -> RefreshOutcome {
        Self::refresh_slot(&self.modules, store, "module", |node| {
            let text = store.info(node, "udf-list")?;
            Ok(parse_modules(&text).into_iter().map(|m| (m.name.clone(), m)).collect())
        })
    }

    #[must_use]
    pub fn index(&self, bin_name: &str) -> Option<IndexDescriptor> {
        self.indexes.get(bin_name)
    }

    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<NamespaceDescriptor> {
        self.namespaces.get(name)
    }

    #[must_use]
    pub fn module(&self, name: &str) -> Option<ModuleDescriptor> {
        self.modules.get(name)
    }

    #[must_use]
    pub fn indexes(&self) -> Catalog<IndexDescriptor> {
        self.indexes.snapshot()
    }

    #[must_use]
    pub fn namespaces(&self) -> Catalog<NamespaceDescriptor> {
        self.namespaces.snapshot()
    }

    #[must_use]
    pub fn modules(&self) -> Catalog<ModuleDescriptor> {
        self.modules.snapshot()
    }

    pub fn clear(&self) {
        self.indexes.clear();
        self.namespaces.clear();
        self.modules.clear();
    }
}

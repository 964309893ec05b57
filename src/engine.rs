use crate::config::EngineConfig;
use crate::errors::{QueryError, QueryResult};
use crate::metadata::cache::{Catalog, MetadataCache, RefreshOutcome, first_answer};
use crate::metadata::{IndexDescriptor, ModuleDescriptor, NamespaceDescriptor, parse_module_content};
use crate::qualifier::Qualifier;
use crate::query::{Executor, MetricsSnapshot, MutationReport, QueryMetrics, QueryPlan, ResultIterator};
use crate::store::{Bin, Key, NativeFilter, Statement, StoreClient};
use bson::Bson;
use std::sync::Arc;

/// Consumer-facing query engine over one store client.
///
/// Owns the metadata caches and per-engine metrics. All calls are blocking; the engine
/// is `Sync` and may be shared between threads, refreshes of one catalog are exclusive.
pub struct QueryEngine {
    store: Arc<dyn StoreClient>,
    cache: MetadataCache,
    config: EngineConfig,
    metrics: QueryMetrics,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("nodes", &self.store.node_names())
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl QueryEngine {
    /// Builds an engine with empty caches. Nothing is fetched until a refresh.
    ///
    /// # Errors
    /// `Config` when `config` does not validate.
    pub fn new(store: Arc<dyn StoreClient>, config: EngineConfig) -> QueryResult<Self> {
        config.validate()?;
        Ok(Self { store, cache: MetadataCache::new(), config, metrics: QueryMetrics::new() })
    }

    /// Default configuration followed by [`Self::refresh_cluster`].
    ///
    /// # Errors
    /// See [`Self::refresh_cluster`].
    pub fn connect(store: Arc<dyn StoreClient>) -> QueryResult<Self> {
        let engine = Self::new(store, EngineConfig::default())?;
        engine.refresh_cluster()?;
        Ok(engine)
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            store: self.store.as_ref(),
            cache: &self.cache,
            config: &self.config,
            metrics: &self.metrics,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- metadata ----

    /// Refreshes indexes, namespaces and modules, then makes sure the filter module is
    /// registered. Safe to repeat: an already registered module is not uploaded again.
    ///
    /// # Errors
    /// Only the module upload can fail; unreachable nodes are skipped during refresh.
    pub fn refresh_cluster(&self) -> QueryResult<()> {
        self.refresh_indexes();
        self.refresh_namespaces();
        self.refresh_modules();
        self.executor().ensure_filter_module()?;
        Ok(())
    }

    pub fn refresh_indexes(&self) -> RefreshOutcome {
        let outcome = self.cache.refresh_indexes(self.store.as_ref());
        self.metrics.log_refresh(&outcome);
        outcome
    }

    pub fn refresh_namespaces(&self) -> RefreshOutcome {
        let outcome = self.cache.refresh_namespaces(self.store.as_ref());
        self.metrics.log_refresh(&outcome);
        outcome
    }

    pub fn refresh_modules(&self) -> RefreshOutcome {
        let outcome = self.cache.refresh_modules(self.store.as_ref());
        self.metrics.log_refresh(&outcome);
        outcome
    }

    /// Cached index on `bin_name`, if any.
    #[must_use]
    pub fn index(&self, bin_name: &str) -> Option<IndexDescriptor> {
        self.cache.index(bin_name)
    }

    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<NamespaceDescriptor> {
        self.cache.namespace(name)
    }

    #[must_use]
    pub fn module(&self, name: &str) -> Option<ModuleDescriptor> {
        self.cache.module(name)
    }

    #[must_use]
    pub fn indexes(&self) -> Catalog<IndexDescriptor> {
        self.cache.indexes()
    }

    #[must_use]
    pub fn namespaces(&self) -> Catalog<NamespaceDescriptor> {
        self.cache.namespaces()
    }

    #[must_use]
    pub fn modules(&self) -> Catalog<ModuleDescriptor> {
        self.cache.modules()
    }

    /// Fetches a module's source from the first node that answers.
    /// `Ok(None)` when the cluster does not know the module.
    ///
    /// # Errors
    /// `Connection` when no node answers, `Store` on an undecodable response.
    pub fn module_source(&self, name: &str) -> QueryResult<Option<String>> {
        let file_name = self
            .cache
            .module(name)
            .map_or_else(|| format!("{name}.lua"), |m| m.file_name);
        let command = format!("udf-get:filename={file_name}");
        let (answer, skipped) =
            first_answer(self.store.as_ref(), "module source", |node| self.store.info(node, &command));
        match answer {
            Some((_, text)) => parse_module_content(&text),
            None => Err(QueryError::Connection(format!(
                "no node answered {command} ({skipped} tried)"
            ))),
        }
    }

    // ---- queries ----

    /// Runs a query over `namespace`/`set` with an optional caller-supplied native filter.
    ///
    /// # Errors
    /// Planning errors before any store call, store errors when the query is issued.
    pub fn select(
        &self,
        namespace: &str,
        set: Option<&str>,
        filter: Option<NativeFilter>,
        qualifiers: &[Qualifier],
    ) -> QueryResult<ResultIterator> {
        let mut statement = Statement::new(namespace, set);
        statement.filter = filter;
        self.select_statement(&statement, false, qualifiers)
    }

    /// Full planner entry. `meta_only` fetches key and generation without bin data.
    ///
    /// # Errors
    /// As [`Self::select`].
    pub fn select_statement(
        &self,
        statement: &Statement,
        meta_only: bool,
        qualifiers: &[Qualifier],
    ) -> QueryResult<ResultIterator> {
        self.executor().select(statement, meta_only, qualifiers)
    }

    /// The plan `select_statement` would run, without touching the store.
    ///
    /// # Errors
    /// Planning errors only.
    pub fn explain(&self, statement: &Statement, qualifiers: &[Qualifier]) -> QueryResult<QueryPlan> {
        self.executor().plan(statement, false, qualifiers).map(|p| p.plan)
    }

    /// Paged range scans were never supported alongside a server-side program.
    ///
    /// # Errors
    /// Always `FeatureNotImplemented`.
    pub fn select_paged(
        &self,
        _statement: &Statement,
        _page_size: usize,
        _qualifiers: &[Qualifier],
    ) -> QueryResult<ResultIterator> {
        Err(QueryError::FeatureNotImplemented(
            "paged selection with a server-side filter".into(),
        ))
    }

    /// Caller-supplied filter programs are not accepted; qualifiers are the only input.
    ///
    /// # Errors
    /// Always `FeatureNotImplemented`.
    pub fn select_with_program(
        &self,
        _statement: &Statement,
        _program: &str,
    ) -> QueryResult<ResultIterator> {
        Err(QueryError::FeatureNotImplemented("user-supplied filter programs".into()))
    }

    // ---- mutations ----

    /// Writes `bins` to every record matching `qualifiers`.
    ///
    /// A sole key qualifier is a blind write. Otherwise each matched record is written
    /// only if its generation is unchanged since it was read.
    ///
    /// # Errors
    /// Planning errors, a failure to start the scan, or a connection loss mid-batch.
    /// Per-record failures are counted in the report instead.
    pub fn update(
        &self,
        statement: &Statement,
        bins: &[Bin],
        qualifiers: &[Qualifier],
    ) -> QueryResult<MutationReport> {
        self.executor().update(statement, bins, qualifiers)
    }

    /// Deletes every record matching `qualifiers`.
    ///
    /// # Errors
    /// As [`Self::update`].
    pub fn delete(&self, statement: &Statement, qualifiers: &[Qualifier]) -> QueryResult<MutationReport> {
        self.executor().delete(statement, qualifiers)
    }

    /// Create-only write.
    ///
    /// # Errors
    /// `RecordExists` when the key is taken, `InvalidArgument` on an unusable key.
    pub fn insert(
        &self,
        namespace: &str,
        set: Option<&str>,
        user_key: impl Into<Bson>,
        bins: &[Bin],
    ) -> QueryResult<Key> {
        self.executor().insert(namespace, set, user_key.into(), bins)
    }

    // ---- lifecycle ----

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn metrics_text(&self) -> String {
        self.metrics.metrics_text()
    }

    /// Drops cached metadata. The engine stays usable; caches fill again on refresh.
    pub fn close(&self) {
        self.cache.clear();
        log::debug!("query engine closed, metadata cache cleared");
    }
}

use super::cursor::ResultIterator;
use super::plan::{PlannedQuery, QueryPlan, plan_query, resolve_key};
use super::telemetry::QueryMetrics;
use super::types::{MutationKind, MutationReport};
use crate::config::EngineConfig;
use crate::errors::{QueryError, QueryResult};
use crate::metadata::cache::MetadataCache;
use crate::qualifier::Qualifier;
use crate::store::{
    AggregateCall, Bin, GenerationPolicy, Key, KeyRecord, RecordExistsAction, Statement,
    StoreClient, WritePolicy,
};
use bson::{Bson, doc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const MUTATIONS_TARGET: &str = "binquery::mutations";

/// Source of the server-side filter module, uploaded when the cluster lacks it.
pub const FILTER_MODULE_SOURCE: &str = include_str!("../../modules/as_utility.lua");

/// Borrowed view of an engine's collaborators for one call.
pub(crate) struct Executor<'a> {
    pub store: &'a dyn StoreClient,
    pub cache: &'a MetadataCache,
    pub config: &'a EngineConfig,
    pub metrics: &'a QueryMetrics,
}

impl Executor<'_> {
    pub fn plan(&self, statement: &Statement, meta_only: bool, qualifiers: &[Qualifier]) -> QueryResult<PlannedQuery> {
        plan_query(statement, meta_only, qualifiers, |bin| self.cache.index(bin))
    }

    pub fn select(&self, statement: &Statement, meta_only: bool, qualifiers: &[Qualifier]) -> QueryResult<ResultIterator> {
        let planned = self.plan(statement, meta_only, qualifiers)?;
        self.execute(planned)
    }

    pub fn execute(&self, planned: PlannedQuery) -> QueryResult<ResultIterator> {
        let PlannedQuery { plan, generation_checks } = planned;
        let kind = plan.kind();
        match plan {
            QueryPlan::PointLookup { key, header_only, bin_names } => {
                self.metrics.log_query(&key.namespace, key.set.as_deref(), kind, None);
                let record = if header_only {
                    self.store.get_header(&key)?
                } else {
                    self.store.get(&key, bin_names.as_deref())?
                };
                Ok(ResultIterator::single(record.map(|record| KeyRecord { key, record }), generation_checks))
            }
            QueryPlan::NativeScan { statement } => {
                self.metrics.log_query(&statement.namespace, statement.set.as_deref(), kind, None);
                Ok(ResultIterator::native(self.store.query(&statement)?, generation_checks))
            }
            QueryPlan::NativeFilterPlusProgram { statement, program }
            | QueryPlan::ProgramOnly { statement, program } => {
                self.metrics.log_query(
                    &statement.namespace,
                    statement.set.as_deref(),
                    kind,
                    Some(program.as_str()),
                );
                self.ensure_filter_module()?;
                let module = &self.config.filter_module;
                let call = AggregateCall {
                    module: module.name.clone(),
                    function: module.function.clone(),
                    args: doc! {
                        "includeAllFields": statement.include_bin_data,
                        "filterFuncStr": program.into_string(),
                    },
                };
                let cursor = self.store.query_aggregate(&statement, &call)?;
                Ok(ResultIterator::aggregated(
                    cursor,
                    &statement.namespace,
                    statement.set.as_deref(),
                    generation_checks,
                ))
            }
        }
    }

    /// Makes sure the filter module is on the cluster. Returns whether it was uploaded.
    ///
    /// A module missing from the cache triggers one module refresh first, so a module
    /// that is already deployed is never uploaded twice.
    pub fn ensure_filter_module(&self) -> QueryResult<bool> {
        let module = &self.config.filter_module;
        if !self.config.register_filter_module || self.cache.module(&module.name).is_some() {
            return Ok(false);
        }
        let outcome = self.cache.refresh_modules(self.store);
        self.metrics.log_refresh(&outcome);
        if self.cache.module(&module.name).is_some() {
            return Ok(false);
        }
        self.store.register_module(&module.file_name, FILTER_MODULE_SOURCE)?;
        log::info!("registered filter module {}", module.file_name);
        let outcome = self.cache.refresh_modules(self.store);
        self.metrics.log_refresh(&outcome);
        Ok(true)
    }

    pub fn update(&self, statement: &Statement, bins: &[Bin], qualifiers: &[Qualifier]) -> QueryResult<MutationReport> {
        let base = self.config.write.policy();
        if let [q] = qualifiers
            && let Some(k) = q.as_key()
        {
            let key = resolve_key(statement, k)?;
            self.store.put(&base, &key, bins)?;
            let report = MutationReport { read: 1, write: 1 };
            self.metrics.log_mutation(MutationKind::Update.as_str(), &statement.namespace, report);
            return Ok(report);
        }
        self.mutate_matching(MutationKind::Update, statement, qualifiers, |key, generation| {
            let policy = WritePolicy {
                generation: GenerationPolicy::ExpectEqual(generation),
                exists: RecordExistsAction::UpdateOnly,
                ..base.clone()
            };
            self.store.put(&policy, key, bins).map(|()| true)
        })
    }

    pub fn delete(&self, statement: &Statement, qualifiers: &[Qualifier]) -> QueryResult<MutationReport> {
        let base = self.config.write.policy();
        if let [q] = qualifiers
            && let Some(k) = q.as_key()
        {
            let key = resolve_key(statement, k)?;
            let existed = self.store.delete(&base, &key)?;
            let report = MutationReport { read: 1, write: u64::from(existed) };
            self.metrics.log_mutation(MutationKind::Delete.as_str(), &statement.namespace, report);
            return Ok(report);
        }
        self.mutate_matching(MutationKind::Delete, statement, qualifiers, |key, _| {
            self.store.delete(&base, key)
        })
    }

    pub fn insert(&self, namespace: &str, set: Option<&str>, user_key: Bson, bins: &[Bin]) -> QueryResult<Key> {
        let key = Key::new(namespace, set, user_key)?;
        let policy = WritePolicy { exists: RecordExistsAction::CreateOnly, ..self.config.write.policy() };
        self.store.put(&policy, &key, bins)?;
        Ok(key)
    }

    /// Enumerates matching records by header and applies `op` to each.
    ///
    /// `op` returns whether the record was mutated. Per-record errors are logged and
    /// counted as not written; a connection error stops the batch and is returned.
    fn mutate_matching<F>(
        &self,
        kind: MutationKind,
        statement: &Statement,
        qualifiers: &[Qualifier],
        op: F,
    ) -> QueryResult<MutationReport>
    where
        F: Fn(&Key, u32) -> QueryResult<bool> + Sync,
    {
        let candidates = {
            let mut it = self.select(statement, true, qualifiers)?;
            let mut out = Vec::new();
            for rec in it.by_ref() {
                let rec = rec?;
                out.push((rec.key, rec.record.generation));
            }
            it.close();
            out
        };
        let read = u64::try_from(candidates.len()).unwrap_or(u64::MAX);
        let written = AtomicU64::new(0);
        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<QueryError>> = Mutex::new(None);

        let apply = |batch: &[(Key, u32)]| {
            for (key, generation) in batch {
                if abort.load(Ordering::Relaxed) {
                    return;
                }
                match op(key, *generation) {
                    Ok(true) => {
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        log::warn!(target: MUTATIONS_TARGET, "{} skipped {key}: record no longer exists", kind.as_str());
                    }
                    Err(e) if e.is_fatal() => {
                        log::warn!(target: MUTATIONS_TARGET, "{} aborted at {key}: {e}", kind.as_str());
                        abort.store(true, Ordering::Relaxed);
                        fatal.lock().get_or_insert(e);
                        return;
                    }
                    Err(e) => {
                        log::warn!(target: MUTATIONS_TARGET, "{} failed for {key}: {e}", kind.as_str());
                    }
                }
            }
        };

        let workers = self.config.mutation_parallelism.max(1);
        if workers == 1 || candidates.len() < 2 {
            apply(&candidates);
        } else {
            let chunk = candidates.len().div_ceil(workers);
            std::thread::scope(|s| {
                for batch in candidates.chunks(chunk) {
                    s.spawn(|| apply(batch));
                }
            });
        }

        if let Some(e) = fatal.into_inner() {
            return Err(e);
        }
        let report = MutationReport { read, write: written.into_inner() };
        self.metrics.log_mutation(kind.as_str(), &statement.namespace, report);
        Ok(report)
    }
}

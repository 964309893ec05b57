use super::plan::PlanKind;
use super::types::MutationReport;
use crate::metadata::cache::RefreshOutcome;
use std::sync::atomic::{AtomicU64, Ordering};

pub const METRICS_TARGET: &str = "binquery::metrics";

#[derive(Debug, Default)]
pub struct QueryMetrics {
    point_lookups: AtomicU64,
    native_scans: AtomicU64,
    native_filter_programs: AtomicU64,
    program_scans: AtomicU64,
    records_read: AtomicU64,
    records_mutated: AtomicU64,
    mutation_failures: AtomicU64,
    cache_refreshes: AtomicU64,
    nodes_skipped: AtomicU64,
}

/// Point-in-time copy of [`QueryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub point_lookups: u64,
    pub native_scans: u64,
    pub native_filter_programs: u64,
    pub program_scans: u64,
    pub records_read: u64,
    pub records_mutated: u64,
    pub mutation_failures: u64,
    pub cache_refreshes: u64,
    pub nodes_skipped: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub const fn queries_total(&self) -> u64 {
        self.point_lookups + self.native_scans + self.native_filter_programs + self.program_scans
    }
}

fn hash_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(input.as_bytes());
    hex::encode(h.finalize())
}

impl QueryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one executed plan and emits a JSON line on the metrics target.
    pub fn log_query(&self, namespace: &str, set: Option<&str>, kind: PlanKind, program: Option<&str>) {
        let counter = match kind {
            PlanKind::PointLookup => &self.point_lookups,
            PlanKind::NativeScan => &self.native_scans,
            PlanKind::NativeFilterPlusProgram => &self.native_filter_programs,
            PlanKind::ProgramOnly => &self.program_scans,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if log::log_enabled!(target: METRICS_TARGET, log::Level::Info) {
            let line = serde_json::json!({
                "event": "query",
                "namespace": namespace,
                "set": set,
                "plan": kind.as_str(),
                "program_hash": program.map(hash_hex),
            });
            log::info!(target: METRICS_TARGET, "{line}");
        }
    }

    pub fn log_mutation(&self, op: &str, namespace: &str, report: MutationReport) {
        let failed = report.read.saturating_sub(report.write);
        self.records_read.fetch_add(report.read, Ordering::Relaxed);
        self.records_mutated.fetch_add(report.write, Ordering::Relaxed);
        self.mutation_failures.fetch_add(failed, Ordering::Relaxed);
        let line = serde_json::json!({
            "event": op,
            "namespace": namespace,
            "read": report.read,
            "write": report.write,
            "failed": failed,
        });
        log::info!(target: METRICS_TARGET, "{line}");
    }

    pub fn log_refresh(&self, outcome: &RefreshOutcome) {
        if outcome.refreshed() {
            self.cache_refreshes.fetch_add(1, Ordering::Relaxed);
        }
        self.nodes_skipped.fetch_add(u64::try_from(outcome.skipped).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            point_lookups: load(&self.point_lookups),
            native_scans: load(&self.native_scans),
            native_filter_programs: load(&self.native_filter_programs),
            program_scans: load(&self.program_scans),
            records_read: load(&self.records_read),
            records_mutated: load(&self.records_mutated),
            mutation_failures: load(&self.mutation_failures),
            cache_refreshes: load(&self.cache_refreshes),
            nodes_skipped: load(&self.nodes_skipped),
        }
    }

    /// OpenMetrics-style exposition (no HELP/TYPE lines).
    #[must_use]
    pub fn metrics_text(&self) -> String {
        let m = self.snapshot();
        format!(
            "binquery_plans_total{{kind=\"point_lookup\"}} {}\n\
             binquery_plans_total{{kind=\"native_scan\"}} {}\n\
             binquery_plans_total{{kind=\"native_filter_program\"}} {}\n\
             binquery_plans_total{{kind=\"program_only\"}} {}\n\
             binquery_records_read_total {}\n\
             binquery_records_mutated_total {}\n\
             binquery_mutation_failures_total {}\n\
             binquery_cache_refreshes_total {}\n\
             binquery_nodes_skipped_total {}\n",
            m.point_lookups,
            m.native_scans,
            m.native_filter_programs,
            m.program_scans,
            m.records_read,
            m.records_mutated,
            m.mutation_failures,
            m.cache_refreshes,
            m.nodes_skipped,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_plans_and_mutations() {
        let m = QueryMetrics::new();
        m.log_query("test", Some("people"), PlanKind::PointLookup, None);
        m.log_query("test", None, PlanKind::ProgramOnly, Some("if a == 1 then selectedRec = true end"));
        m.log_mutation("update", "test", MutationReport { read: 5, write: 4 });
        let s = m.snapshot();
        assert_eq!(s.queries_total(), 2);
        assert_eq!(s.records_read, 5);
        assert_eq!(s.records_mutated, 4);
        assert_eq!(s.mutation_failures, 1);
    }

    #[test]
    fn text_exposition() {
        let m = QueryMetrics::new();
        m.log_refresh(&RefreshOutcome { answered_by: Some("n2".into()), skipped: 1, entries: 3 });
        m.log_refresh(&RefreshOutcome { answered_by: None, skipped: 2, entries: 3 });
        let text = m.metrics_text();
        assert!(text.contains("binquery_cache_refreshes_total 1\n"));
        assert!(text.contains("binquery_nodes_skipped_total 3\n"));
        assert!(text.contains("binquery_plans_total{kind=\"point_lookup\"} 0\n"));
    }
}

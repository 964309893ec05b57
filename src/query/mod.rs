// Telemetry is a submodule of query
pub mod telemetry;

// Submodules for separation of concerns
mod compile;
mod cursor;
mod exec;
mod plan;
mod types;

pub(crate) use exec::Executor;

// Public API re-exports
pub use compile::{FilterProgram, SELECT_CLAUSE, compile_filter_program, render_qualifier};
pub use cursor::ResultIterator;
pub use exec::{FILTER_MODULE_SOURCE, MUTATIONS_TARGET};
pub use plan::{PlanKind, PlannedQuery, QueryPlan, plan_query, resolve_key};
pub use telemetry::{METRICS_TARGET, MetricsSnapshot, QueryMetrics};
pub use types::MutationReport;

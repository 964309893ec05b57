//! Qualifier-driven queries and batch mutations over a bin-oriented key-value store.
//!
//! Callers describe what they want as a list of [`Qualifier`]s. The engine picks at most
//! one of them to run against a secondary index, compiles the rest into a filter program
//! evaluated by the store, and hands back a single [`ResultIterator`] whatever path the
//! query took. Batch [`QueryEngine::update`] and [`QueryEngine::delete`] reuse the same
//! planner and guard each write with the generation observed when the record was read.

pub mod config;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod metadata;
pub mod qualifier;
pub mod query;
pub mod store;

pub use config::EngineConfig;
pub use engine::QueryEngine;
pub use errors::{QueryError, QueryResult};
pub use qualifier::{FieldQualifier, FilterOperation, GenerationQualifier, KeyQualifier, Qualifier};
pub use query::{MutationReport, QueryPlan, ResultIterator, compile_filter_program};
pub use store::{Bin, Key, KeyRecord, NativeFilter, Record, Statement, StoreClient};

// Integration suites, grouped the way src/ is laid out
#[path = "support.rs"]
mod support;

#[path = "mod_config.rs"]
mod config_tests;
#[path = "mod_logger.rs"]
mod logger_tests;
#[path = "mod_metadata.rs"]
mod metadata_tests;
#[path = "mod_mutations.rs"]
mod mutation_tests;
#[path = "mod_query.rs"]
mod query_tests;

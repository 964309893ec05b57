// Property suites
#[path = "prop_compile.rs"]
mod prop_compile;
#[path = "prop_mutations.rs"]
mod prop_mutations;

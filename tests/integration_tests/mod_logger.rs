use binquery::query::{METRICS_TARGET, MUTATIONS_TARGET};
use std::fs;
use tempfile::tempdir;

#[test]
fn configure_logging_writes_app_mutations_metrics_in_dir() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("proc_logs");
    binquery::logger::configure_logging(Some(&base), Some("debug"), Some(3)).unwrap();
    log::info!("hello app");
    log::warn!(target: MUTATIONS_TARGET, "update failed for test:abc");
    log::info!(target: METRICS_TARGET, "{{\"event\":\"query\"}}");
    log::logger().flush();
    assert!(base.join("app.log").exists());
    assert!(base.join("mutations.log").exists());
    assert!(base.join("metrics.log").exists());
    let mutations = fs::read_to_string(base.join("mutations.log")).unwrap();
    assert!(mutations.contains("update failed"));
    let app = fs::read_to_string(base.join("app.log")).unwrap();
    assert!(!app.contains("update failed"));
}

#[test]
fn init_path_reports_a_missing_file() {
    let dir = tempdir().unwrap();
    assert!(binquery::logger::init_path(&dir.path().join("missing.yaml")).is_err());
}

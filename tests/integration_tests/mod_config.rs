use binquery::EngineConfig;
use binquery::config::CONFIG_FILE;
use std::fs;
use tempfile::tempdir;

#[test]
fn load_reads_an_explicit_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE);
    fs::write(
        &path,
        "register_filter_module = false\nmutation_parallelism = 3\n\n[filter_module]\nname = \"filters\"\nfile_name = \"filters.lua\"\n",
    )
    .unwrap();
    let cfg = EngineConfig::load(Some(&path)).unwrap();
    assert!(!cfg.register_filter_module);
    assert_eq!(cfg.filter_module.name, "filters");
    assert_eq!(cfg.filter_module.function, "select_records");
}

#[test]
fn unreadable_or_invalid_files_are_errors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "mutation_parallelism = \"lots\"").unwrap();
    assert!(EngineConfig::from_file(&path).is_err());
    assert!(EngineConfig::from_file(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn config_round_trips_through_toml() {
    let cfg = EngineConfig { mutation_parallelism: 6, ..EngineConfig::default() };
    let text = toml::to_string(&cfg).unwrap();
    assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), cfg);
}

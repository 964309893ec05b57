//! Engine configuration.
//!
//! Precedence: explicit path > `BINQUERY_CONFIG` > `./binquery.toml` > defaults, then
//! environment overrides for individual fields.

use crate::errors::{QueryError, QueryResult};
use crate::store::WritePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "BINQUERY_CONFIG";
pub const CONFIG_FILE: &str = "binquery.toml";

/// Identity of the server-side filter module. Must match the deployed module exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterModuleConfig {
    pub name: String,
    pub file_name: String,
    pub function: String,
}

impl Default for FilterModuleConfig {
    fn default() -> Self {
        Self {
            name: "as_utility".into(),
            file_name: "as_utility.lua".into(),
            function: "select_records".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Store the user key alongside the record.
    pub send_key: bool,
    /// Record TTL in seconds; `None` keeps the namespace default.
    pub expiration: Option<u32>,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self { send_key: true, expiration: None }
    }
}

impl WriteConfig {
    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        WritePolicy { send_key: self.send_key, expiration: self.expiration, ..WritePolicy::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub filter_module: FilterModuleConfig,
    /// Upload the filter module on first use when the cluster does not have it.
    pub register_filter_module: bool,
    /// Worker threads for per-record batch writes; 1 is sequential.
    pub mutation_parallelism: usize,
    pub write: WriteConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            filter_module: FilterModuleConfig::default(),
            register_filter_module: true,
            mutation_parallelism: 1,
            write: WriteConfig::default(),
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// `Toml` on a parse failure, `Config` on invalid values.
    pub fn from_toml_str(s: &str) -> QueryResult<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// `Io` when the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file(path: &Path) -> QueryResult<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| QueryError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    /// Loads the first config file found, then applies environment overrides.
    ///
    /// # Errors
    /// Fails when a file that exists cannot be parsed, or an override is invalid.
    pub fn load(explicit: Option<&Path>) -> QueryResult<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(p));
        }
        if let Ok(cur) = std::env::current_dir() {
            candidates.push(cur.join(CONFIG_FILE));
        }
        let mut cfg = match candidates.iter().find(|p| p.exists()) {
            Some(p) => {
                log::debug!("loading engine config from {}", p.display());
                Self::from_file(p)?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Applies `BINQUERY_MODULE_NAME`, `BINQUERY_MODULE_FUNCTION` and
    /// `BINQUERY_MUTATION_PARALLELISM` from `lookup`.
    ///
    /// # Errors
    /// `Config` when a value does not parse or the result is invalid.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> QueryResult<()> {
        if let Some(name) = lookup("BINQUERY_MODULE_NAME") {
            self.filter_module.file_name = format!("{name}.lua");
            self.filter_module.name = name;
        }
        if let Some(function) = lookup("BINQUERY_MODULE_FUNCTION") {
            self.filter_module.function = function;
        }
        if let Some(n) = lookup("BINQUERY_MUTATION_PARALLELISM") {
            self.mutation_parallelism = n.trim().parse().map_err(|_| {
                QueryError::Config(format!("BINQUERY_MUTATION_PARALLELISM is not a number: {n}"))
            })?;
        }
        self.validate()
    }

    /// # Errors
    /// `Config` for empty module identifiers or zero parallelism.
    pub fn validate(&self) -> QueryResult<()> {
        let m = &self.filter_module;
        if m.name.is_empty() || m.file_name.is_empty() || m.function.is_empty() {
            return Err(QueryError::Config("filter module name, file and function must be set".into()));
        }
        if self.mutation_parallelism == 0 {
            return Err(QueryError::Config("mutation_parallelism must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_module() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.filter_module.name, "as_utility");
        assert_eq!(cfg.filter_module.file_name, "as_utility.lua");
        assert_eq!(cfg.filter_module.function, "select_records");
        assert!(cfg.register_filter_module);
        assert_eq!(cfg.mutation_parallelism, 1);
        assert!(cfg.write.send_key);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str("mutation_parallelism = 4\n[write]\nexpiration = 60\n").unwrap();
        assert_eq!(cfg.mutation_parallelism, 4);
        assert_eq!(cfg.write.expiration, Some(60));
        assert!(cfg.write.send_key);
        assert_eq!(cfg.filter_module, FilterModuleConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("mutation_parallelism = 0"),
            Err(QueryError::Config(_))
        ));
        assert!(matches!(EngineConfig::from_toml_str("mutation_parallelism = ["), Err(QueryError::Toml(_))));
    }

    #[test]
    fn env_overrides() {
        let mut cfg = EngineConfig::default();
        cfg.apply_env_overrides(|k| match k {
            "BINQUERY_MODULE_NAME" => Some("filters".into()),
            "BINQUERY_MUTATION_PARALLELISM" => Some("8".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.filter_module.name, "filters");
        assert_eq!(cfg.filter_module.file_name, "filters.lua");
        assert_eq!(cfg.mutation_parallelism, 8);

        let bad = cfg.apply_env_overrides(|k| (k == "BINQUERY_MUTATION_PARALLELISM").then(|| "many".into()));
        assert!(matches!(bad, Err(QueryError::Config(_))));
    }

    #[test]
    fn write_policy_from_config() {
        let w = WriteConfig { send_key: false, expiration: Some(5) };
        let p = w.policy();
        assert!(!p.send_key);
        assert_eq!(p.expiration, Some(5));
    }
}

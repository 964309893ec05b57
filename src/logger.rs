//! log4rs setup for the engine's three log streams.
//!
//! - `app.log`: everything not routed elsewhere
//! - `mutations.log`: target `binquery::mutations`, one line per failed batch write
//! - `metrics.log`: target `binquery::metrics`, one JSON line per query or batch

use crate::errors::{QueryError, QueryResult};
use crate::query::{METRICS_TARGET, MUTATIONS_TARGET};
use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_RETENTION: usize = 7;

/// Parses `error|warn|info|debug|trace|off`; anything else is `info`.
#[must_use]
pub fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling(base: &Path, stem: &str, keep: u32) -> QueryResult<RollingFileAppender> {
    let pattern = base.join(format!("{stem}.{{}}.log"));
    let roller = FixedWindowRoller::builder()
        .build(&pattern.display().to_string(), keep)
        .map_err(|e| QueryError::Config(format!("log roller for {stem}: {e}")))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(base.join(format!("{stem}.log")), Box::new(policy))
        .map_err(|e| QueryError::Io(format!("{stem}.log: {e}")))
}

/// Builds the log4rs configuration without installing it.
///
/// # Errors
/// `Io` when the directory or a log file cannot be created, `Config` on a bad layout.
pub fn build_config(dir: Option<&Path>, level: Option<&str>, retention: Option<usize>) -> QueryResult<Config> {
    let base = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&base)?;
    let keep = u32::try_from(retention.unwrap_or(DEFAULT_RETENTION).max(1)).unwrap_or(u32::MAX);
    let lvl = parse_level(level);

    Config::builder()
        .appender(Appender::builder().build("app", Box::new(rolling(&base, "app", keep)?)))
        .appender(Appender::builder().build("mutations", Box::new(rolling(&base, "mutations", keep)?)))
        .appender(Appender::builder().build("metrics", Box::new(rolling(&base, "metrics", keep)?)))
        .logger(Logger::builder().appender("mutations").additive(false).build(MUTATIONS_TARGET, lvl))
        .logger(Logger::builder().appender("metrics").additive(false).build(METRICS_TARGET, lvl))
        .build(Root::builder().appender("app").build(lvl))
        .map_err(|e| QueryError::Config(e.to_string()))
}

/// Installs the process-wide logger.
/// - dir: base directory for logs; if None, current directory.
/// - level: error|warn|info|debug|trace
/// - retention: number of rolled files to keep (default 7)
///
/// # Errors
/// As [`build_config`], plus `Config` when a logger is already installed.
pub fn configure_logging(dir: Option<&Path>, level: Option<&str>, retention: Option<usize>) -> QueryResult<()> {
    let config = build_config(dir, level, retention)?;
    log4rs::init_config(config).map_err(|e| QueryError::Config(e.to_string()))?;
    Ok(())
}

/// Configure logging from environment variables if present:
/// - BINQUERY_LOG_DIR
/// - BINQUERY_LOG_LEVEL
/// - BINQUERY_LOG_RETENTION
///
/// # Errors
/// As [`configure_logging`].
pub fn configure_from_env() -> QueryResult<()> {
    let dir = std::env::var("BINQUERY_LOG_DIR").ok().map(PathBuf::from);
    let level = std::env::var("BINQUERY_LOG_LEVEL").ok();
    let retention = std::env::var("BINQUERY_LOG_RETENTION").ok().and_then(|s| s.parse::<usize>().ok());
    configure_logging(dir.as_deref(), level.as_deref(), retention)
}

/// Initializes logging from a log4rs YAML file.
///
/// # Errors
/// `Config` when the file cannot be loaded.
pub fn init_path(path: &Path) -> QueryResult<()> {
    log4rs::init_file(path, log4rs::config::Deserializers::default())
        .map_err(|e| QueryError::Config(format!("{}: {e}", path.display())))
}

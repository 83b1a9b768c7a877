use std::path::{Path, PathBuf};

use chatstream_runtime::EnvSource;
use chatstream_runtime::env::parse_bool_env;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "chatstream.logs.jsonl";

fn observability_enabled(env: &EnvSource) -> bool {
    for key in ["CHATSTREAM_OBSERVABILITY_ENABLED", "CHATSTREAM_OBSERVABILITY"] {
        if let Some(value) = env.get(key) {
            return parse_bool_env(&value).unwrap_or(true);
        }
    }
    true
}

fn resolve_env_filter(env: &EnvSource) -> EnvFilter {
    for key in ["CHATSTREAM_LOG_LEVEL", "RUST_LOG"] {
        if let Some(level) = env.get(key)
            && let Ok(filter) = EnvFilter::try_new(level)
        {
            return filter;
        }
    }
    EnvFilter::new("info")
}

fn json_log_target(path_raw: &str) -> (PathBuf, String) {
    let path = PathBuf::from(path_raw);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_JSON_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process from the process environment.
///
/// Environment variables:
/// - `CHATSTREAM_OBSERVABILITY_ENABLED` / `CHATSTREAM_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `CHATSTREAM_LOG_LEVEL`: optional level/filter override (`info`, `chatstream::debug=trace`, etc.).
/// - `CHATSTREAM_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr in a compact console format.
/// - `RUST_LOG`: fallback filter.
pub fn init_observability() {
    init_observability_with(&EnvSource::process());
}

/// Same as [`init_observability`] with an explicit environment.
pub fn init_observability_with(env: &EnvSource) {
    INIT.get_or_init(|| {
        if !observability_enabled(env) {
            return;
        }

        let env_filter = resolve_env_filter(env);
        if let Some(path_raw) = env.get("CHATSTREAM_JSON_LOG_PATH") {
            let (dir, file_name) = json_log_target(&path_raw);
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_by_default_and_switchable() {
        assert!(observability_enabled(&EnvSource::empty()));
        assert!(!observability_enabled(&EnvSource::from_pairs([(
            "CHATSTREAM_OBSERVABILITY",
            "off"
        )])));
        assert!(observability_enabled(&EnvSource::from_pairs([(
            "CHATSTREAM_OBSERVABILITY_ENABLED",
            "garbage"
        )])));
        assert!(!observability_enabled(&EnvSource::from_pairs([
            ("CHATSTREAM_OBSERVABILITY_ENABLED", "0"),
            ("CHATSTREAM_OBSERVABILITY", "1"),
        ])));
    }

    #[test]
    fn level_override_wins_over_rust_log() {
        let env = EnvSource::from_pairs([("CHATSTREAM_LOG_LEVEL", "debug"), ("RUST_LOG", "warn")]);
        assert_eq!(resolve_env_filter(&env).to_string(), "debug");
        let env = EnvSource::from_pairs([("RUST_LOG", "warn")]);
        assert_eq!(resolve_env_filter(&env).to_string(), "warn");
        assert_eq!(resolve_env_filter(&EnvSource::empty()).to_string(), "info");
    }

    #[test]
    fn json_log_path_splits_into_dir_and_file() {
        let (dir, file) = json_log_target("logs/run.jsonl");
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(file, "run.jsonl");
        let (dir, file) = json_log_target("run.jsonl");
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(file, "run.jsonl");
    }

    #[test]
    fn init_is_idempotent_when_disabled() {
        let env = EnvSource::from_pairs([("CHATSTREAM_OBSERVABILITY", "false")]);
        init_observability_with(&env);
        init_observability_with(&env);
    }
}

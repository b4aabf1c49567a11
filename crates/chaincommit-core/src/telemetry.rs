//! Logging setup for binaries and test harnesses embedding the event stack.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application. [`init_tracing`] is the one-call way to do it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output encoding of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level for everything without an override.
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-target overrides, e.g. `chaincommit-core::session = "debug"`.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Let a set `RUST_LOG` replace the directives built from this config.
    #[serde(default = "default_true")]
    pub honor_env: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            targets: BTreeMap::new(),
            format: LogFormat::default(),
            honor_env: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.targets.insert(target.into(), level.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    /// `EnvFilter` directives, e.g. `"info,chaincommit_core::handler=debug"`.
    /// Crate names are accepted with dashes and normalised to the
    /// underscore form tracing targets use.
    pub fn directives(&self) -> String {
        self.targets.iter().fold(self.level.clone(), |acc, (target, level)| {
            format!("{acc},{}={level}", target.replace('-', "_"))
        })
    }

    fn filter(&self) -> EnvFilter {
        if self.honor_env {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        EnvFilter::try_new(self.directives()).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber described by `config`.
///
/// Returns `false`, changing nothing, when a global subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.filter());
    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_normalise_target_names() {
        let config = LogConfig::default()
            .with_target("chaincommit-storage", "warn")
            .with_target("chaincommit-core::session", "debug");
        assert_eq!(config.directives(), "info,chaincommit_core::session=debug,chaincommit_storage=warn");
    }

    #[test]
    fn parses_from_json_with_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"format":"json","targets":{"chaincommit_core":"trace"}}"#).unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.honor_env);
        assert_eq!(config.directives(), "info,chaincommit_core=trace");
    }

    #[test]
    fn second_init_is_harmless() {
        let config = LogConfig::default().with_level("debug");
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}

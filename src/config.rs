//! Runtime configuration, loaded from a TOML file and overridable from the CLI.

use std::path::Path;

use serde::Deserialize;

use crate::error::BootstrapError;

fn default_worker_count() -> usize {
    8
}

fn default_module_path() -> String {
    "./service/?.so".to_owned()
}

fn default_logservice() -> String {
    "logger".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_bootstrap() -> String {
    "snlua bootstrap".to_owned()
}

fn default_harbor() -> u8 {
    1
}

/// Mirrors skynet's `config` file keys (spec §6), deserialized with `serde` instead of the
/// original's Lua table. Field names are the idiomatic Rust spelling; `#[serde(rename)]`
/// keeps the on-disk keys identical to spec §6's table so an existing config file's key names
/// carry over unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `thread`: number of worker threads in the dispatch pool (default 8).
    #[serde(rename = "thread", default = "default_worker_count")]
    pub worker_count: usize,

    /// `cpath`: `;`-separated directories (each with a `?` module-name placeholder) searched
    /// for dynamically loaded modules.
    #[serde(rename = "cpath", default = "default_module_path")]
    pub module_path: String,

    /// `harbor`: this node's 8-bit cluster node id (default 1; 0 means single-node).
    #[serde(default = "default_harbor")]
    pub harbor: u8,

    /// `bootstrap`: module name (plus args) launched as the first user service, e.g.
    /// `"snlua main"`.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,

    /// `daemon`: PID file path. Absent means run in the foreground.
    #[serde(default)]
    pub daemon: Option<String>,

    /// `logger`: init argument string handed to the logger service.
    #[serde(default)]
    pub logger: String,

    /// `logservice`: module name of the logger service (default `"logger"`).
    #[serde(rename = "logservice", default = "default_logservice")]
    pub logservice: String,

    /// `profile`: enable per-service CPU-time accounting.
    #[serde(default)]
    pub profile: bool,

    /// `[ADDED]` `tracing-subscriber` `EnvFilter` directive, e.g. `"info"` or
    /// `"mailrt=debug"`. Not a skynet config key; this crate's ambient logging stack needs
    /// somewhere to read its filter from.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `[ADDED]` optional path to a log file; when set, the bundled logger module writes
    /// there instead of just `tracing`, and `SIGHUP` triggers a reopen.
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: default_worker_count(),
            module_path: default_module_path(),
            harbor: default_harbor(),
            bootstrap: default_bootstrap(),
            daemon: None,
            logger: String::new(),
            logservice: default_logservice(),
            profile: false,
            log_level: default_log_level(),
            log_path: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, BootstrapError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BootstrapError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| BootstrapError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_count, 8, "spec §6: `thread` defaults to 8");
        assert_eq!(cfg.harbor, 1, "spec §6: `harbor` defaults to 1");
        assert_eq!(cfg.logservice, "logger");
        assert!(!cfg.profile);
        assert!(cfg.daemon.is_none());
        assert!(cfg.log_path.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str(r#"thread = 16"#).unwrap();
        assert_eq!(cfg.worker_count, 16);
        assert_eq!(cfg.logservice, "logger");
    }

    #[test]
    fn skynet_style_keys_deserialize_onto_rust_field_names() {
        let toml = r#"
            thread = 4
            cpath = "./service/?.so;./cservice/?.so"
            harbor = 2
            bootstrap = "snlua main"
            daemon = "/var/run/mailrtd.pid"
            logger = "logfile.txt"
            logservice = "snlua"
            profile = true
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.module_path, "./service/?.so;./cservice/?.so");
        assert_eq!(cfg.harbor, 2);
        assert_eq!(cfg.bootstrap, "snlua main");
        assert_eq!(cfg.daemon.as_deref(), Some("/var/run/mailrtd.pid"));
        assert_eq!(cfg.logger, "logfile.txt");
        assert_eq!(cfg.logservice, "snlua");
        assert!(cfg.profile);
    }
}

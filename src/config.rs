//! Tracker configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file named by
//! `LEAKHOOK_CONFIG`, then individual `LEAKHOOK_*` environment variables.

use std::{env, fs, path::PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Maximum number of individual leaks listed in a text report.
pub const DEFAULT_MAX_REPORT_LEAKS: usize = 100;

/// Upper bound on installed stubs across all hooked libraries.
pub const DEFAULT_MAX_INSTALLS: usize = 512;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Log every tracked event and every tracking miss.
    pub debug: bool,
    /// Capture a call stack for every tracked allocation.
    pub backtrace: bool,
    /// Libraries hooked automatically when loaded through `LD_PRELOAD`.
    pub targets: Vec<String>,
    pub max_report_leaks: usize,
    /// Where the preload library writes its report when the process exits.
    pub report_path: Option<PathBuf>,
    pub max_installs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            backtrace: false,
            targets: Vec::new(),
            max_report_leaks: DEFAULT_MAX_REPORT_LEAKS,
            report_path: None,
            max_installs: DEFAULT_MAX_INSTALLS,
        }
    }
}

impl Config {
    pub fn new(debug: bool, backtrace: bool) -> Self {
        Config {
            debug,
            backtrace,
            ..Config::default()
        }
    }

    /// Parse a YAML document. Missing keys keep their defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("LEAKHOOK_CONFIG") {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("cannot read {}: {}", path, e)))?;
                Self::from_yaml(&text)?
            }
            None => Config::default(),
        };

        if let Some(value) = lookup("LEAKHOOK_DEBUG") {
            config.debug = parse_bool("LEAKHOOK_DEBUG", &value)?;
        }
        if let Some(value) = lookup("LEAKHOOK_BACKTRACE") {
            config.backtrace = parse_bool("LEAKHOOK_BACKTRACE", &value)?;
        }
        if let Some(value) = lookup("LEAKHOOK_TARGETS") {
            config.targets = value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup("LEAKHOOK_REPORT") {
            config.report_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("LEAKHOOK_MAX_REPORT_LEAKS") {
            config.max_report_leaks = value.trim().parse().map_err(|_| {
                Error::Config(format!("LEAKHOOK_MAX_REPORT_LEAKS: not a number: {}", value))
            })?;
        }
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("{}: not a boolean: {}", key, other))),
    }
}

//! Runtime configuration, assembled from CLI arguments and an optional
//! `qtap.toml` config file.
//!
//! Precedence: CLI flag, then config-file default, then built-in default.
//! An explicitly passed `-c` file that cannot be read or parsed is a
//! fail-fast error; the implicit `qtap.toml` in the working directory is
//! only loaded when present.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REPORTER: &str = "minimal";

/// A `[browsers.<name>]` entry: the command line used to open a URL.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub command: String,
}

/// `[defaults]` section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    pub reporter: Option<String>,
    pub timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
}

/// Parsed contents of `qtap.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub browsers: BTreeMap<String, BrowserConfig>,
    #[serde(default)]
    pub defaults: Defaults,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub inputs: Vec<String>,
    pub browsers: Vec<String>,
    pub reporter: String,
    pub cwd: PathBuf,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub debug: bool,
    pub verbose: bool,
    pub watch: bool,
}

impl Config {
    pub fn from_args(args: &cli::Args) -> Result<(Config, FileConfig)> {
        let cwd = match &args.cwd {
            Some(dir) => PathBuf::from(dir),
            None => env::current_dir().context("failed to resolve current directory")?,
        };

        let file_config = match &args.config {
            Some(path) => FileConfig::load(Path::new(path))?,
            None => {
                let implicit = cwd.join("qtap.toml");
                if implicit.is_file() {
                    FileConfig::load(&implicit)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let debug = debug_enabled(args.debug, env::var("QTAP_DEBUG").ok().as_deref());

        let browsers = if args.browser.is_empty() {
            vec!["detect".to_string()]
        } else {
            args.browser.clone()
        };

        let reporter = args
            .reporter
            .clone()
            .or_else(|| file_config.defaults.reporter.clone())
            .unwrap_or_else(|| DEFAULT_REPORTER.to_string());

        let idle_timeout = args
            .timeout
            .or(file_config.defaults.timeout)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let connect_timeout = args
            .connect_timeout
            .or(file_config.defaults.connect_timeout)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let config = Config {
            inputs: args.files.clone(),
            browsers,
            reporter,
            cwd,
            idle_timeout: Duration::from_secs(idle_timeout),
            connect_timeout: Duration::from_secs(connect_timeout),
            debug,
            verbose: args.verbose,
            watch: args.watch,
        };
        Ok((config, file_config))
    }
}

/// `QTAP_DEBUG=1` is equivalent to `--debug`.
fn debug_enabled(flag: bool, env_value: Option<&str>) -> bool {
    flag || env_value == Some("1")
}

//! Browser launchers and the name → launcher registry.
//!
//! A launcher owns one browser process for one client. Its future resolves
//! only after the browser signal was cancelled and the process reaped; it
//! rejects when the browser cannot be started or exits on its own. Opening
//! the URL is not success.

pub mod custom;
pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::config::FileConfig;
use crate::output::logger::Logger;

/// Everything a launcher gets handed for one client session.
pub struct LaunchContext {
    /// The instrumented test URL to open.
    pub url: String,
    /// Cancelled when this client is done; the launcher must then shut the
    /// browser down and resolve.
    pub browser_signal: CancellationToken,
    /// Cancelled once at end of run; shared resources (profile
    /// directories, long-lived sessions) tear down on it.
    pub global_signal: CancellationToken,
    pub logger: Logger,
    pub debug: bool,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Registry key, e.g. `firefox`.
    fn name(&self) -> &str;

    /// Human-readable name shown by reporters.
    fn display_name(&self) -> String {
        self.name().to_string()
    }

    /// Whether an executable for this browser can be found right now.
    /// `detect` uses this; launching still performs its own lookup.
    fn available(&self) -> bool {
        true
    }

    async fn launch(&self, ctx: LaunchContext) -> Result<()>;
}

/// Shared exit discipline: wait for the process, translating the outcome
/// per the launcher contract.
pub async fn wait_for_exit(
    mut child: Child,
    browser_signal: &CancellationToken,
    name: &str,
) -> Result<()> {
    tokio::select! {
        status = child.wait() => {
            let status = status.with_context(|| format!("failed to wait for {name}"))?;
            if browser_signal.is_cancelled() {
                Ok(())
            } else {
                bail!("browser {name} exited unexpectedly ({status})")
            }
        }
        _ = browser_signal.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

/// Look up the first of `candidates` on `PATH`.
pub fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in candidates {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
            if cfg!(windows) {
                let with_exe = dir.join(format!("{name}.exe"));
                if with_exe.is_file() {
                    return Some(with_exe);
                }
            }
        }
    }
    None
}

/// Delete a per-browser profile directory once the global signal fires.
/// Deletion retries because a freshly-exited browser can still hold file
/// locks on Windows; a final failure is logged, not fatal.
pub(crate) fn register_profile_cleanup(
    global_signal: &CancellationToken,
    dir: PathBuf,
    logger: Logger,
) {
    let global_signal = global_signal.clone();
    tokio::spawn(async move {
        global_signal.cancelled().await;
        for attempt in 1..=3 {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => return,
                Err(_) if attempt < 3 => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => {
                    logger.warn(format!(
                        "could not remove profile dir {}: {}",
                        dir.display(),
                        err
                    ));
                }
            }
        }
    });
}

/// Order in which `detect` tries the stock browsers.
const DETECT_ORDER: &[&str] = &["firefox", "chrome", "chromium", "edge"];

/// Resolves browser names to launchers. Stock local browsers are always
/// registered; config-defined custom browsers may shadow them.
pub struct BrowserRegistry {
    launchers: BTreeMap<String, Arc<dyn BrowserLauncher>>,
}

impl Default for BrowserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserRegistry {
    pub fn new() -> Self {
        let mut registry = BrowserRegistry {
            launchers: BTreeMap::new(),
        };
        for browser in local::stock() {
            registry.insert(Arc::new(browser));
        }
        registry
    }

    /// Stock browsers plus `[browsers.<name>]` entries from the config
    /// file.
    pub fn from_config(config: &FileConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, browser) in &config.browsers {
            let launcher = custom::CustomBrowser::new(name.clone(), browser.command.clone())?;
            registry.insert(Arc::new(launcher));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, launcher: Arc<dyn BrowserLauncher>) {
        self.launchers.insert(launcher.name().to_string(), launcher);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BrowserLauncher>> {
        self.launchers.get(name).cloned()
    }

    /// Resolve CLI browser names, expanding `detect` and deduplicating.
    /// Unknown names fail before anything is launched.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn BrowserLauncher>>> {
        let mut resolved: Vec<Arc<dyn BrowserLauncher>> = Vec::new();
        for name in names {
            let launcher = if name == "detect" {
                self.detect()?
            } else {
                self.get(name)
                    .with_context(|| format!("unknown browser '{name}'"))?
            };
            if !resolved.iter().any(|l| l.name() == launcher.name()) {
                resolved.push(launcher);
            }
        }
        Ok(resolved)
    }

    fn detect(&self) -> Result<Arc<dyn BrowserLauncher>> {
        for name in DETECT_ORDER {
            if let Some(launcher) = self.get(name) {
                if launcher.available() {
                    return Ok(launcher);
                }
            }
        }
        bail!("no supported browser found; install one or configure a custom browser")
    }
}

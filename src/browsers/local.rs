//! Stock launchers for locally installed browsers.
//!
//! Each launch gets a fresh profile directory under the system temp dir so
//! runs never share state; the directory is registered for removal on the
//! global signal. Browsers run headless unless the run is in debug mode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{
    find_executable, register_profile_cleanup, wait_for_exit, BrowserLauncher, LaunchContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Gecko,
    Chromium,
}

pub struct LocalBrowser {
    name: &'static str,
    display: &'static str,
    binaries: &'static [&'static str],
    engine: Engine,
}

/// The stock browser set.
pub fn stock() -> Vec<LocalBrowser> {
    vec![
        LocalBrowser {
            name: "firefox",
            display: "Mozilla Firefox",
            binaries: &["firefox", "firefox-esr"],
            engine: Engine::Gecko,
        },
        LocalBrowser {
            name: "chrome",
            display: "Google Chrome",
            binaries: &["google-chrome", "google-chrome-stable", "chrome"],
            engine: Engine::Chromium,
        },
        LocalBrowser {
            name: "chromium",
            display: "Chromium",
            binaries: &["chromium", "chromium-browser"],
            engine: Engine::Chromium,
        },
        LocalBrowser {
            name: "edge",
            display: "Microsoft Edge",
            binaries: &["microsoft-edge", "msedge"],
            engine: Engine::Chromium,
        },
    ]
}

static PROFILE_SEQ: AtomicU64 = AtomicU64::new(1);

fn fresh_profile_dir(name: &str) -> PathBuf {
    let seq = PROFILE_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qtap-{}-{}-{}", name, std::process::id(), seq))
}

/// Command-line arguments for one launch.
fn build_args(engine: Engine, profile: &Path, url: &str, headless: bool) -> Vec<String> {
    let profile = profile.to_string_lossy().into_owned();
    match engine {
        Engine::Gecko => {
            let mut args = vec![
                "-profile".to_string(),
                profile,
                "-no-remote".to_string(),
                "-new-instance".to_string(),
            ];
            if headless {
                args.push("-headless".to_string());
            }
            args.push(url.to_string());
            args
        }
        Engine::Chromium => {
            let mut args = vec![
                format!("--user-data-dir={profile}"),
                "--no-first-run".to_string(),
                "--no-default-browser-check".to_string(),
                "--disable-gpu".to_string(),
            ];
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push(url.to_string());
            args
        }
    }
}

#[async_trait]
impl BrowserLauncher for LocalBrowser {
    fn name(&self) -> &str {
        self.name
    }

    fn display_name(&self) -> String {
        self.display.to_string()
    }

    fn available(&self) -> bool {
        find_executable(self.binaries).is_some()
    }

    async fn launch(&self, ctx: LaunchContext) -> Result<()> {
        let executable = find_executable(self.binaries)
            .with_context(|| format!("no executable found for browser {}", self.name))?;

        let profile = fresh_profile_dir(self.name);
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("failed to create profile dir {}", profile.display()))?;
        register_profile_cleanup(&ctx.global_signal, profile.clone(), ctx.logger.clone());

        let args = build_args(self.engine, &profile, &ctx.url, !ctx.debug);
        ctx.logger
            .debug(format!("spawning {} {}", executable.display(), args.join(" ")));

        // Debug-mode browsers must survive the harness for inspection.
        let child = tokio::process::Command::new(&executable)
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(!ctx.debug)
            .spawn()
            .with_context(|| format!("failed to spawn {}", executable.display()))?;

        wait_for_exit(child, &ctx.browser_signal, self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_includes_the_expected_names() {
        let names: Vec<&str> = stock().iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["firefox", "chrome", "chromium", "edge"]);
    }

    #[test]
    fn gecko_args_headless() {
        let args = build_args(Engine::Gecko, Path::new("/tmp/p"), "http://x/", true);
        assert!(args.contains(&"-headless".to_string()));
        assert!(args.contains(&"-no-remote".to_string()));
        assert_eq!(args.last().unwrap(), "http://x/");
    }

    #[test]
    fn gecko_args_debug_keeps_window() {
        let args = build_args(Engine::Gecko, Path::new("/tmp/p"), "http://x/", false);
        assert!(!args.contains(&"-headless".to_string()));
    }

    #[test]
    fn chromium_args_carry_profile_and_url() {
        let args = build_args(Engine::Chromium, Path::new("/tmp/p"), "http://x/", true);
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));
        assert!(args.contains(&"--headless=new".to_string()));
        assert_eq!(args.last().unwrap(), "http://x/");
    }

    #[test]
    fn profile_dirs_are_unique() {
        assert_ne!(fresh_profile_dir("firefox"), fresh_profile_dir("firefox"));
    }

    #[test]
    fn display_names() {
        let browsers = stock();
        assert_eq!(browsers[0].display_name(), "Mozilla Firefox");
        assert_eq!(browsers[1].display_name(), "Google Chrome");
    }
}

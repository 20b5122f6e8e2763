//! Config-defined browsers.
//!
//! A `[browsers.<name>] command = "..."` entry in the config file becomes a
//! launcher: the command is shell-split, `{url}` placeholders are replaced
//! with the instrumented test URL (appended when absent), and the process
//! is supervised under the same exit discipline as the stock browsers.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::{wait_for_exit, BrowserLauncher, LaunchContext};

pub struct CustomBrowser {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CustomBrowser {
    pub fn new(name: String, command: String) -> Result<CustomBrowser> {
        let parts = shlex::split(&command)
            .with_context(|| format!("invalid command for browser '{name}': \"{command}\""))?;
        if parts.is_empty() {
            bail!("empty command for browser '{name}'");
        }
        let mut iter = parts.into_iter();
        let program = iter.next().unwrap();
        Ok(CustomBrowser {
            name,
            program,
            args: iter.collect(),
        })
    }

    fn args_for(&self, url: &str) -> Vec<String> {
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{url}") {
                    substituted = true;
                    arg.replace("{url}", url)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(url.to_string());
        }
        args
    }
}

#[async_trait]
impl BrowserLauncher for CustomBrowser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn launch(&self, ctx: LaunchContext) -> Result<()> {
        let args = self.args_for(&ctx.url);
        ctx.logger
            .debug(format!("spawning {} {}", self.program, args.join(" ")));

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(!ctx.debug)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        wait_for_exit(child, &ctx.browser_signal, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_with_quotes() {
        let browser =
            CustomBrowser::new("mine".to_string(), "mybrowser --flag 'two words'".to_string())
                .unwrap();
        assert_eq!(browser.program, "mybrowser");
        assert_eq!(browser.args, vec!["--flag", "two words"]);
    }

    #[test]
    fn rejects_malformed_command() {
        assert!(CustomBrowser::new("bad".to_string(), "unclosed 'quote".to_string()).is_err());
        assert!(CustomBrowser::new("empty".to_string(), "".to_string()).is_err());
    }

    #[test]
    fn substitutes_url_placeholder() {
        let browser =
            CustomBrowser::new("mine".to_string(), "b --app={url} --quiet".to_string()).unwrap();
        let args = browser.args_for("http://127.0.0.1:1/t.html");
        assert_eq!(args, vec!["--app=http://127.0.0.1:1/t.html", "--quiet"]);
    }

    #[test]
    fn appends_url_when_no_placeholder() {
        let browser = CustomBrowser::new("mine".to_string(), "b --quiet".to_string()).unwrap();
        let args = browser.args_for("http://x/");
        assert_eq!(args, vec!["--quiet", "http://x/"]);
    }
}

//! Built-in reporters.
//!
//! `minimal` is the default human-facing reporter: one line per client,
//! failure details, and a run summary. `plain` prints every event as it
//! happens, `json` emits one JSON object per event for machine consumers,
//! and `none` is silent.

use anyhow::{bail, Result};
use colored::Colorize;

use crate::events::{Reporter, RunEvent};

/// Reporter names accepted by `-r/--reporter` and `qtap.toml`.
pub const REPORTER_NAMES: &[&str] = &["minimal", "plain", "json", "none"];

/// Build a reporter by name. Unknown names are a user-input error and must
/// fail before any browser is launched.
pub fn create(name: &str) -> Result<Box<dyn Reporter>> {
    match name {
        "minimal" => Ok(Box::new(MinimalReporter::default())),
        "plain" => Ok(Box::new(PlainReporter)),
        "json" => Ok(Box::new(JsonReporter)),
        "none" => Ok(Box::new(NoneReporter)),
        other => bail!(
            "unknown reporter '{}': must be one of {}",
            other,
            REPORTER_NAMES.join(", ")
        ),
    }
}

#[derive(Default)]
pub struct MinimalReporter;

impl Reporter for MinimalReporter {
    fn on_event(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Client(c) => {
                println!(
                    "{} {} {} {}",
                    "Running".dimmed(),
                    c.test_file.cyan(),
                    "in".dimmed(),
                    c.display_name
                );
            }
            RunEvent::Online(_) | RunEvent::Clients(_) => {}
            RunEvent::ConsoleError(e) => {
                for line in e.message.lines() {
                    eprintln!("  {} {}", "console:".yellow(), line);
                }
            }
            RunEvent::Bail(b) => {
                eprintln!(
                    "{} {} {}",
                    "✘".red().bold(),
                    b.client_id.dimmed(),
                    b.reason.red()
                );
            }
            RunEvent::Result(r) => {
                if r.result.ok {
                    println!(
                        "{} {} {} passed",
                        "✔".green().bold(),
                        r.client_id.dimmed(),
                        r.result.passed
                    );
                } else {
                    eprintln!(
                        "{} {} {} failed of {}",
                        "✘".red().bold(),
                        r.client_id.dimmed(),
                        r.result.failed,
                        r.result.total
                    );
                    for failure in &r.result.failures {
                        eprintln!("  {} {} - {}", "not ok".red(), failure.number, failure.name);
                        if let Some(ref diag) = failure.diag {
                            for line in diag.lines() {
                                eprintln!("      {}", line.dimmed());
                            }
                        }
                    }
                }
            }
            RunEvent::Finish(f) => {
                if let Some(ref reason) = f.bailout {
                    eprintln!("{} {}", "Bail out!".red().bold(), reason);
                }
                let verdict = if f.ok { "OK".green() } else { "FAILED".red() };
                println!(
                    "{} {} total, {} passed, {} failed",
                    verdict.bold(),
                    f.total,
                    f.passed,
                    f.failed
                );
            }
            RunEvent::Error(e) => {
                eprintln!("{} {}", "Error:".red().bold(), e.message);
            }
        }
    }
}

/// One dimmed line per event, useful when watching a run live.
pub struct PlainReporter;

impl Reporter for PlainReporter {
    fn on_event(&mut self, event: &RunEvent) {
        let line = match event {
            RunEvent::Client(c) => format!(
                "client {} {} {} ({})",
                c.client_id, c.test_file, c.browser_name, c.display_name
            ),
            RunEvent::Online(o) => format!("online {}", o.client_id),
            RunEvent::ConsoleError(e) => {
                format!("consoleerror {} {}", e.client_id, e.message.replace('\n', " | "))
            }
            RunEvent::Bail(b) => format!("bail {} {}", b.client_id, b.reason),
            RunEvent::Result(r) => format!(
                "result {} ok={} total={} passed={} failed={}",
                r.client_id, r.result.ok, r.result.total, r.result.passed, r.result.failed
            ),
            RunEvent::Clients(c) => format!("clients {}", c.clients.len()),
            RunEvent::Finish(f) => format!(
                "finish ok={} exitCode={} total={} passed={} failed={}",
                f.ok, f.exit_code, f.total, f.passed, f.failed
            ),
            RunEvent::Error(e) => format!("error {}", e.message),
        };
        println!("{}", line);
    }
}

/// NDJSON: one serialized event per line.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn on_event(&mut self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            println!("{json}");
        }
    }
}

pub struct NoneReporter;

impl Reporter for NoneReporter {
    fn on_event(&mut self, _event: &RunEvent) {}
}

//! qtap - run HTML test files in real browsers and report TAP results.

mod browsers;
mod cli;
mod client;
mod config;
mod events;
mod interrupt;
mod output;
mod page;
mod run;
mod server;
mod supervisor;
mod tap;
mod watchdog;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli() -> Result<ExitCode> {
    let args = cli::Args::parse_args();
    let (config, file_config) = config::Config::from_args(&args)?;
    let registry = browsers::BrowserRegistry::from_config(&file_config)?;

    // Reporter names are validated up front, before any server or browser
    // starts.
    output::reporters::create(&config.reporter)?;

    let interrupt_token = CancellationToken::new();
    interrupt::register_signal_handler(interrupt_token.clone())?;

    if config.watch {
        run_watch(&config, &registry, &interrupt_token).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let reporter = output::reporters::create(&config.reporter)?;
    match run::run(&config, &registry, vec![reporter], &interrupt_token).await {
        Ok(finish) => Ok(if finish.ok {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }),
        // The failure was already surfaced through the `error` event.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

/// Watch mode: re-run the whole suite whenever a test file changes, until
/// interrupted.
async fn run_watch(
    config: &config::Config,
    registry: &browsers::BrowserRegistry,
    interrupt_token: &CancellationToken,
) -> Result<()> {
    loop {
        let reporter = output::reporters::create(&config.reporter)?;
        let _ = run::run(config, registry, vec![reporter], interrupt_token).await;

        if interrupt_token.is_cancelled() {
            return Ok(());
        }
        println!("Watching for changes... (Ctrl+C to exit)");
        if !wait_for_change(config, interrupt_token).await {
            return Ok(());
        }
    }
}

/// Poll test file mtimes until one changes. Returns false when the wait
/// was interrupted instead.
async fn wait_for_change(
    config: &config::Config,
    interrupt_token: &CancellationToken,
) -> bool {
    let paths: Vec<PathBuf> = config
        .inputs
        .iter()
        .filter(|input| !input.starts_with("http://") && !input.starts_with("https://"))
        .map(|input| config.cwd.join(input))
        .collect();
    if paths.is_empty() {
        // URL-only suites have nothing to watch.
        interrupt_token.cancelled().await;
        return false;
    }

    let baseline = mtimes(&paths);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(500)) => {
                if mtimes(&paths) != baseline {
                    return true;
                }
            }
            _ = interrupt_token.cancelled() => return false,
        }
    }
}

fn mtimes(paths: &[PathBuf]) -> Vec<Option<SystemTime>> {
    paths
        .iter()
        .map(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
        .collect()
}

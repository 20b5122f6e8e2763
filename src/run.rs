//! The run orchestrator.
//!
//! One control server per deduplicated test input, one supervisor per
//! (server × browser) pair, all concurrent. Terminal outcomes are
//! aggregated into a single [`RunFinish`]; every run ends with exactly one
//! of `finish` or `error` on the bus, after which the servers close and
//! the global cancellation tears down shared resources.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::browsers::BrowserRegistry;
use crate::client::ClientOutcome;
use crate::config::Config;
use crate::events::{
    ClientEvent, ClientsEvent, ErrorEvent, EventBus, FinishEvent, Reporter, RunEvent,
};
use crate::output::logger::Logger;
use crate::server::{ControlServer, TestInput};
use crate::supervisor;
use crate::watchdog;

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinish {
    pub ok: bool,
    pub exit_code: i32,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub bailout: Option<String>,
}

struct Tally {
    ok: bool,
    total: u64,
    passed: u64,
    failed: u64,
    bailout: Option<String>,
}

impl Tally {
    fn new() -> Self {
        Tally {
            ok: true,
            total: 0,
            passed: 0,
            failed: 0,
            bailout: None,
        }
    }

    fn add(&mut self, outcome: ClientOutcome) {
        match outcome {
            ClientOutcome::Result(result) => {
                self.ok &= result.ok;
                self.total += result.total;
                self.passed += result.passed;
                self.failed += result.failed;
            }
            ClientOutcome::Bail(reason) => {
                self.ok = false;
                if self.bailout.is_none() {
                    self.bailout = Some(reason);
                }
            }
        }
    }

    fn into_finish(self) -> RunFinish {
        let exit_code = if self.ok { 0 } else { 1 };
        RunFinish {
            ok: self.ok,
            exit_code,
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            bailout: self.bailout,
        }
    }
}

/// Run every (input × browser) pair to completion.
///
/// `interrupt` is the caller's cancellation (Ctrl+C); the run derives its
/// own global token from it so that end-of-run teardown does not affect
/// the caller's token.
pub async fn run(
    config: &Config,
    registry: &BrowserRegistry,
    reporters: Vec<Box<dyn Reporter>>,
    interrupt: &CancellationToken,
) -> Result<RunFinish> {
    let logger = Logger::new(config.verbose || config.debug);
    let bus = EventBus::new();
    for reporter in reporters {
        bus.subscribe(reporter);
    }
    let global = interrupt.child_token();

    let mut servers: Vec<ControlServer> = Vec::new();
    let outcome = execute(config, registry, &bus, &global, &logger, &mut servers).await;

    match outcome {
        Ok(finish) => {
            bus.emit(RunEvent::Finish(FinishEvent {
                ok: finish.ok,
                exit_code: finish.exit_code,
                total: finish.total,
                passed: finish.passed,
                failed: finish.failed,
                bailout: finish.bailout.clone(),
            }));
            shutdown(&servers, &global);
            Ok(finish)
        }
        Err(err) => {
            bus.emit(RunEvent::Error(ErrorEvent {
                message: format!("{err:#}"),
            }));
            shutdown(&servers, &global);
            Err(err)
        }
    }
}

fn shutdown(servers: &[ControlServer], global: &CancellationToken) {
    for server in servers {
        server.close();
    }
    global.cancel();
}

async fn execute(
    config: &Config,
    registry: &BrowserRegistry,
    bus: &Arc<EventBus>,
    global: &CancellationToken,
    logger: &Logger,
    servers: &mut Vec<ControlServer>,
) -> Result<RunFinish> {
    // User input is validated before anything launches.
    let launchers = registry.resolve(&config.browsers)?;

    let mut inputs = Vec::new();
    let mut seen = HashSet::new();
    for raw in &config.inputs {
        if seen.insert(raw.clone()) {
            inputs.push(TestInput::resolve(raw, &config.cwd)?);
        }
    }

    // Servers start listening in parallel.
    let input_count = inputs.len();
    let mut startups = JoinSet::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let bus = bus.clone();
        let logger = logger.clone();
        startups.spawn(async move { (index, ControlServer::start(input, bus, &logger).await) });
    }
    let mut started: Vec<Option<ControlServer>> = (0..input_count).map(|_| None).collect();
    let mut startup_failure: Option<anyhow::Error> = None;
    while let Some(joined) = startups.join_next().await {
        match joined {
            Ok((index, Ok(server))) => started[index] = Some(server),
            Ok((_, Err(err))) => {
                startup_failure.get_or_insert(err);
            }
            Err(err) => {
                startup_failure.get_or_insert(anyhow!("server startup task failed: {err}"));
            }
        }
    }
    servers.extend(started.into_iter().flatten());
    if let Some(err) = startup_failure {
        return Err(err);
    }

    for server in servers.iter() {
        watchdog::spawn(
            server.shared.clients.clone(),
            config.connect_timeout,
            config.idle_timeout,
            server.shared.shutdown_token(),
        );
    }

    // The `clients` snapshot fires once every pair has announced itself.
    let pair_count = servers.len() * launchers.len();
    let (launched_tx, mut launched_rx) = mpsc::channel::<ClientEvent>(pair_count.max(1));
    let snapshot_bus = bus.clone();
    tokio::spawn(async move {
        let mut clients = Vec::new();
        while clients.len() < pair_count {
            match launched_rx.recv().await {
                Some(info) => clients.push(info),
                None => return,
            }
        }
        snapshot_bus.emit(RunEvent::Clients(ClientsEvent { clients }));
    });

    // Cancelled when the run must come down early; every supervisor bails
    // its client on it, including clients registered after the trigger.
    let stop = CancellationToken::new();

    let mut supervisors = JoinSet::new();
    for server in servers.iter() {
        for launcher in &launchers {
            supervisors.spawn(supervisor::run_pair(
                server.shared.clone(),
                launcher.clone(),
                global.clone(),
                stop.clone(),
                config.debug,
                launched_tx.clone(),
            ));
        }
    }
    drop(launched_tx);

    let fault = bus.fault_token();
    let mut tally = Tally::new();
    let mut first_error: Option<anyhow::Error> = None;
    let mut fault_seen = false;
    let mut interrupted = false;

    loop {
        tokio::select! {
            joined = supervisors.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(outcome))) => tally.add(outcome),
                    Some(Ok(Err(err))) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                            stop.cancel();
                        } else {
                            logger.debug(format!("additional launch failure: {err:#}"));
                        }
                    }
                    Some(Err(err)) => {
                        if first_error.is_none() {
                            first_error = Some(anyhow!("supervisor task failed: {err}"));
                            stop.cancel();
                        }
                    }
                }
            }
            _ = fault.cancelled(), if !fault_seen => {
                fault_seen = true;
                if first_error.is_none() {
                    first_error = Some(anyhow!(bus
                        .fault_message()
                        .unwrap_or_else(|| "reporter failure".to_string())));
                }
                stop.cancel();
            }
            _ = global.cancelled(), if !interrupted => {
                interrupted = true;
                stop.cancel();
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(tally.into_finish()),
    }
}

//! Liveness timeouts.
//!
//! One periodic sweep per control server checks every live client against
//! the connect and idle deadlines. A single 100 ms timer stays cheap no
//! matter how many TAP lines arrive, unlike re-arming a timer per
//! assertion.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientMap, ClientOutcome, ClientState};

pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn the sweep task for one server's clients. Stops when `shutdown`
/// fires.
pub fn spawn(
    clients: ClientMap,
    connect_timeout: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(&clients, connect_timeout, idle_timeout),
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

fn sweep(clients: &ClientMap, connect_timeout: Duration, idle_timeout: Duration) {
    let snapshot: Vec<_> = clients.lock().unwrap().values().cloned().collect();
    for client in snapshot {
        let (state, since_launch, idle) = client.liveness();
        match state {
            ClientState::Launching if since_launch > connect_timeout => {
                client.try_terminal(
                    ClientState::TimedOutConnect,
                    ClientOutcome::Bail(format!(
                        "Browser did not start within {}s",
                        connect_timeout.as_secs()
                    )),
                );
            }
            ClientState::Connected if idle > idle_timeout => {
                client.try_terminal(
                    ClientState::TimedOutIdle,
                    ClientOutcome::Bail(format!("Browser idle for {}s", idle_timeout.as_secs())),
                );
            }
            _ => {}
        }
    }
}

//! Per-client lifecycle state machine.
//!
//! A client is one (test input × browser) session. Transitions are
//! monotonic: `launching → connected → (finished | bailed | timed out |
//! launch error)`. A terminal transition happens at most once; whichever of
//! the parser, the watchdog, or the supervisor gets there first wins, and
//! late signals are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::events::{BailEvent, ConsoleErrorEvent, EventBus, OnlineEvent, ResultEvent, RunEvent};
use crate::output::logger::Logger;
use crate::tap::finish::{FinishDetector, FinishKind};
use crate::tap::parser::{Parser, TapEvent};
use crate::tap::FinalResult;

/// Registry of live clients, shared between the control server's handlers,
/// the watchdog, and the supervisors. A terminal client is removed from the
/// registry before its `result`/`bail` event fires.
pub type ClientMap = Arc<Mutex<HashMap<String, Arc<Client>>>>;

/// How long after a satisfied plan to keep the stream open for trailing
/// output (late comments, diagnostics) before ending the parser. Bailouts
/// finish immediately.
pub const TAP_GRACE: Duration = Duration::from_millis(250);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique client id.
pub fn next_client_id() -> String {
    format!("client_{}", CLIENT_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Launching,
    Connected,
    Finished,
    Bailed,
    TimedOutConnect,
    TimedOutIdle,
    LaunchError,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ClientState::Launching | ClientState::Connected)
    }
}

/// What a terminal client produced; exactly one per client.
#[derive(Debug, Clone)]
pub enum ClientOutcome {
    Result(FinalResult),
    Bail(String),
}

struct Inner {
    state: ClientState,
    launch_start: Instant,
    last_activity: Instant,
    parser: Parser,
    detector: FinishDetector,
    outcome: Option<ClientOutcome>,
}

pub struct Client {
    pub id: String,
    pub test_file: String,
    pub browser_name: String,
    pub display_name: String,
    /// Cancelled on any terminal transition; aborts the browser process
    /// (except in debug mode, where the launcher holds a dummy token).
    pub token: CancellationToken,
    proxy_base: String,
    bus: Arc<EventBus>,
    registry: ClientMap,
    logger: Logger,
    inner: Mutex<Inner>,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        test_file: String,
        browser_name: String,
        display_name: String,
        proxy_base: String,
        bus: Arc<EventBus>,
        registry: ClientMap,
        logger: Logger,
    ) -> Arc<Client> {
        let now = Instant::now();
        let logger = logger.scoped(&id);
        let client = Arc::new(Client {
            id: id.clone(),
            test_file,
            browser_name,
            display_name,
            token: CancellationToken::new(),
            proxy_base,
            bus,
            registry: registry.clone(),
            logger,
            inner: Mutex::new(Inner {
                state: ClientState::Launching,
                launch_start: now,
                last_activity: now,
                parser: Parser::new(),
                detector: FinishDetector::new(),
                outcome: None,
            }),
        });
        registry.lock().unwrap().insert(id, client.clone());
        client
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    pub fn outcome(&self) -> Option<ClientOutcome> {
        self.inner.lock().unwrap().outcome.clone()
    }

    /// Snapshot for the watchdog: (state, time since launch, time idle).
    pub fn liveness(&self) -> (ClientState, Duration, Duration) {
        let inner = self.inner.lock().unwrap();
        (
            inner.state,
            inner.launch_start.elapsed(),
            inner.last_activity.elapsed(),
        )
    }

    /// First HTTP hit on the instrumented page: `launching → connected`,
    /// emits `online`. Reloads just refresh the activity clock.
    pub fn mark_online(&self) {
        let emit = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::Launching => {
                    inner.state = ClientState::Connected;
                    inner.last_activity = Instant::now();
                    true
                }
                ClientState::Connected => {
                    inner.last_activity = Instant::now();
                    false
                }
                _ => false,
            }
        };
        if emit {
            self.logger.debug("connected");
            self.bus.emit(RunEvent::Online(OnlineEvent {
                client_id: self.id.clone(),
            }));
        }
    }

    /// Ingest one TAP POST body (already ANSI-stripped). Updates the
    /// activity clock, forwards `# console:` comments, and finishes the
    /// client when the plan is satisfied or a bailout arrives.
    pub fn feed(self: &Arc<Self>, body: &str) {
        let (consoles, finish) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                self.logger.debug("discarding TAP for terminal client");
                return;
            }
            inner.last_activity = Instant::now();

            let events = inner.parser.write(body);
            let mut consoles: Vec<String> = Vec::new();
            let mut open: Option<String> = None;
            let mut finish: Option<FinishKind> = None;

            for event in &events {
                if let TapEvent::Comment { text } = event {
                    if let Some(rest) = text.strip_prefix("# console: ") {
                        // Continuation lines of one message share a POST and
                        // arrive back to back; coalesce them.
                        match open {
                            Some(ref mut message) => {
                                message.push('\n');
                                message.push_str(rest);
                            }
                            None => open = Some(rest.to_string()),
                        }
                        continue;
                    }
                    // Other comments are ignored.
                }
                if let Some(message) = open.take() {
                    consoles.push(message);
                }
                let fired = inner.detector.observe(event);
                if finish.is_none() {
                    finish = fired;
                }
            }
            if let Some(message) = open.take() {
                consoles.push(message);
            }
            (consoles, finish)
        };

        for message in consoles {
            let message = message.replace(&self.proxy_base, "");
            self.bus.emit(RunEvent::ConsoleError(ConsoleErrorEvent {
                client_id: self.id.clone(),
                message,
            }));
        }

        match finish {
            Some(FinishKind::Bailout(reason)) => self.finalize(Some(reason)),
            Some(FinishKind::PlanComplete) => {
                let client = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(TAP_GRACE).await;
                    client.finalize(None);
                });
            }
            None => {}
        }
    }

    /// End the parser and take the terminal transition. No-op when another
    /// path (watchdog, supervisor) terminated the client first.
    fn finalize(self: &Arc<Self>, bailout: Option<String>) {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.parser.end()
        };
        match bailout {
            Some(reason) => {
                self.try_terminal(ClientState::Bailed, ClientOutcome::Bail(reason));
            }
            None => {
                self.try_terminal(ClientState::Finished, ClientOutcome::Result(result));
            }
        }
    }

    /// Take a terminal transition exactly once. On success: cancels the
    /// client token, removes the client from the registry, then emits the
    /// single `result`/`bail` event. Returns false if already terminal.
    pub fn try_terminal(&self, next: ClientState, outcome: ClientOutcome) -> bool {
        debug_assert!(next.is_terminal());
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = next;
            inner.outcome = Some(outcome.clone());
        }
        self.token.cancel();
        self.registry.lock().unwrap().remove(&self.id);
        match outcome {
            ClientOutcome::Result(result) => {
                self.bus.emit(RunEvent::Result(ResultEvent {
                    client_id: self.id.clone(),
                    result,
                }));
            }
            ClientOutcome::Bail(reason) => {
                self.bus.emit(RunEvent::Bail(BailEvent {
                    client_id: self.id.clone(),
                    reason,
                }));
            }
        }
        true
    }
}

//! Typed lifecycle events and the publish/subscribe fan-out that feeds
//! reporters.
//!
//! Reporters are user-controlled code and must not be able to take down the
//! run silently or corrupt the bus: every callback runs behind a panic
//! barrier, and a panicking reporter is dropped from the bus while its
//! panic is surfaced as a run-level fault that the orchestrator turns into
//! an `error` outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::tap::FinalResult;

/// A client was created for one (test file × browser) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    pub client_id: String,
    pub test_file: String,
    pub browser_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineEvent {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleErrorEvent {
    pub client_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BailEvent {
    pub client_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub client_id: String,
    #[serde(flatten)]
    pub result: FinalResult,
}

/// Snapshot of all active clients, emitted once after every launcher has
/// been invoked and all display names are known.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientsEvent {
    pub clients: Vec<ClientEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishEvent {
    pub ok: bool,
    pub exit_code: i32,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bailout: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
}

/// Every event a run can emit, in the shape reporters consume.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RunEvent {
    Client(ClientEvent),
    Online(OnlineEvent),
    #[serde(rename = "consoleerror")]
    ConsoleError(ConsoleErrorEvent),
    Bail(BailEvent),
    Result(ResultEvent),
    Clients(ClientsEvent),
    Finish(FinishEvent),
    Error(ErrorEvent),
}

/// A reporter receives events and renders them; it cannot publish.
pub trait Reporter: Send {
    fn on_event(&mut self, event: &RunEvent);
}

/// Process-scoped fan-out. Delivery is synchronous and in emit order.
pub struct EventBus {
    subscribers: Mutex<Vec<Box<dyn Reporter>>>,
    fault: CancellationToken,
    fault_message: Mutex<Option<String>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus {
            subscribers: Mutex::new(Vec::new()),
            fault: CancellationToken::new(),
            fault_message: Mutex::new(None),
        })
    }

    pub fn subscribe(&self, reporter: Box<dyn Reporter>) {
        self.subscribers.lock().unwrap().push(reporter);
    }

    /// Deliver an event to every subscriber. A panicking subscriber is
    /// removed and recorded as a fault; the remaining subscribers still
    /// receive this and all later events.
    pub fn emit(&self, event: RunEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let mut index = 0;
        while index < subscribers.len() {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscribers[index].on_event(&event)));
            match outcome {
                Ok(()) => index += 1,
                Err(panic) => {
                    subscribers.remove(index);
                    self.record_fault(panic_message(&panic));
                }
            }
        }
    }

    /// Cancelled when any reporter has faulted.
    pub fn fault_token(&self) -> CancellationToken {
        self.fault.clone()
    }

    pub fn fault_message(&self) -> Option<String> {
        self.fault_message.lock().unwrap().clone()
    }

    fn record_fault(&self, message: String) {
        let mut slot = self.fault_message.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
        self.fault.cancel();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    // Some toolchains re-box the unwind payload once more before it reaches
    // catch_unwind, so peel an extra `Box<dyn Any + Send>` layer if present.
    let panic: &(dyn std::any::Any + Send) =
        match panic.downcast_ref::<Box<dyn std::any::Any + Send>>() {
            Some(inner) => inner.as_ref(),
            None => panic,
        };
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("reporter panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("reporter panicked: {s}")
    } else {
        "reporter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collecting {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Reporter for Collecting {
        fn on_event(&mut self, event: &RunEvent) {
            let label = match event {
                RunEvent::Client(_) => "client",
                RunEvent::Online(_) => "online",
                RunEvent::ConsoleError(_) => "consoleerror",
                RunEvent::Bail(_) => "bail",
                RunEvent::Result(_) => "result",
                RunEvent::Clients(_) => "clients",
                RunEvent::Finish(_) => "finish",
                RunEvent::Error(_) => "error",
            };
            self.seen.lock().unwrap().push(label.to_string());
        }
    }

    struct Panicky;

    impl Reporter for Panicky {
        fn on_event(&mut self, _event: &RunEvent) {
            panic!("reporter bug");
        }
    }

    fn online() -> RunEvent {
        RunEvent::Online(OnlineEvent {
            client_id: "client_1".to_string(),
        })
    }

    #[test]
    fn delivers_in_emit_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Collecting { seen: seen.clone() }));

        bus.emit(RunEvent::Client(ClientEvent {
            client_id: "client_1".to_string(),
            test_file: "test.html".to_string(),
            browser_name: "firefox".to_string(),
            display_name: "Mozilla Firefox".to_string(),
        }));
        bus.emit(online());

        assert_eq!(*seen.lock().unwrap(), vec!["client", "online"]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Panicky));
        bus.subscribe(Box::new(Collecting { seen: seen.clone() }));

        bus.emit(online());
        bus.emit(online());

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(bus.fault_token().is_cancelled());
        assert!(bus.fault_message().unwrap().contains("reporter bug"));
    }

    #[test]
    fn fault_records_first_message_only() {
        let bus = EventBus::new();
        bus.subscribe(Box::new(Panicky));
        bus.emit(online());
        let first = bus.fault_message();
        bus.subscribe(Box::new(Panicky));
        bus.emit(online());
        assert_eq!(bus.fault_message(), first);
    }

    #[test]
    fn event_serializes_with_tag_and_camel_case() {
        let json = serde_json::to_string(&RunEvent::ConsoleError(ConsoleErrorEvent {
            client_id: "client_9".to_string(),
            message: "boom".to_string(),
        }))
        .unwrap();
        assert!(json.contains("\"event\":\"consoleerror\""));
        assert!(json.contains("\"clientId\":\"client_9\""));
    }
}

//! Decides when a client's TAP stream is complete.
//!
//! Frameworks disagree on plan placement: most emit `1..N` after the last
//! assertion, some emit it first. The detector handles both orders and
//! recognizes bailouts, which the plan/assert counting alone would miss.

use super::parser::TapEvent;

/// Why the stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishKind {
    /// The plan is known and at least that many assertions were seen.
    PlanComplete,
    /// A `Bail out!` line arrived.
    Bailout(String),
}

/// Tracks plan/assert progress; fires exactly once.
#[derive(Debug, Default)]
pub struct FinishDetector {
    plan: Option<u64>,
    asserts_seen: u64,
    finished: bool,
}

impl FinishDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one parser event. Returns `Some` the first time the stream
    /// is recognized as finished; every later event returns `None`.
    pub fn observe(&mut self, event: &TapEvent) -> Option<FinishKind> {
        if self.finished {
            return None;
        }
        match event {
            TapEvent::Assert(_) => {
                self.asserts_seen += 1;
                if let Some(plan) = self.plan {
                    if self.asserts_seen >= plan {
                        self.finished = true;
                        return Some(FinishKind::PlanComplete);
                    }
                }
            }
            TapEvent::Plan { count } => {
                self.plan = Some(*count);
                if self.asserts_seen >= *count {
                    self.finished = true;
                    return Some(FinishKind::PlanComplete);
                }
            }
            TapEvent::Bailout { reason } => {
                self.finished = true;
                return Some(FinishKind::Bailout(reason.clone()));
            }
            TapEvent::Version(_) | TapEvent::Comment { .. } => {}
        }
        None
    }

    #[allow(dead_code)]
    pub fn finished(&self) -> bool {
        self.finished
    }
}

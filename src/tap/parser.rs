//! Incremental line parser for TAP streams.
//!
//! Chunks arrive in arbitrary sizes (one POST body at a time); the parser
//! carries partial lines across writes and emits one event per completed
//! line. Diagnostic YAML blocks (`  ---` … `  ...`) are attached to the
//! preceding assertion rather than emitted as events.

use std::sync::OnceLock;

use regex::Regex;

use super::{AssertFailure, AssertNote, FinalResult};

/// A single parsed TAP line.
#[derive(Debug, Clone, PartialEq)]
pub enum TapEvent {
    Version(u32),
    Plan { count: u64 },
    Assert(Assert),
    Bailout { reason: String },
    /// A `#` comment line, verbatim (including the leading `#`).
    Comment { text: String },
}

/// Directive suffix on an assertion (`# SKIP reason` / `# TODO reason`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Skip(String),
    Todo(String),
}

/// One `ok` / `not ok` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Assert {
    pub ok: bool,
    pub number: u64,
    pub name: String,
    pub directive: Option<Directive>,
}

fn assert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(not )?ok\b\s*(\d+)?\s*(?:-\s*)?([^#]*)(?:#\s*(?i:(skip|todo))\b\s*(.*))?$")
            .unwrap()
    })
}

fn plan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^1\.\.(\d+)\s*$").unwrap())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^TAP version (\d+)\s*$").unwrap())
}

/// Internal record for the final summary; keeps the diag that events omit.
#[derive(Debug, Clone)]
struct SeenAssert {
    ok: bool,
    number: u64,
    name: String,
    directive: Option<Directive>,
    diag: Option<String>,
}

/// Streaming TAP parser. Feed chunks with [`Parser::write`], then call
/// [`Parser::end`] once to obtain the aggregated [`FinalResult`].
#[derive(Debug)]
pub struct Parser {
    carry: String,
    seen: Vec<SeenAssert>,
    plan: Option<u64>,
    bailout: Option<String>,
    next_number: u64,
    in_diag: bool,
    ended: bool,
    summary: Option<FinalResult>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            carry: String::new(),
            seen: Vec::new(),
            plan: None,
            bailout: None,
            next_number: 1,
            in_diag: false,
            ended: false,
            summary: None,
        }
    }

    /// Feed a chunk of TAP text; returns the events completed by this chunk.
    pub fn write(&mut self, chunk: &str) -> Vec<TapEvent> {
        if self.ended {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.carry.push_str(chunk);

        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.parse_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// End the stream and compute the summary. Idempotent: later calls
    /// return the same result.
    pub fn end(&mut self) -> FinalResult {
        if let Some(ref summary) = self.summary {
            return summary.clone();
        }
        self.ended = true;

        // A trailing line without a newline still counts.
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            self.parse_line(line.trim_end_matches('\r'));
        }

        let mut skips = Vec::new();
        let mut todos = Vec::new();
        let mut failures = Vec::new();
        let mut pass: u64 = 0;

        for assert in &self.seen {
            match assert.directive {
                Some(Directive::Todo(_)) => todos.push(AssertNote {
                    number: assert.number,
                    name: assert.name.clone(),
                }),
                Some(Directive::Skip(_)) => {
                    skips.push(AssertNote {
                        number: assert.number,
                        name: assert.name.clone(),
                    });
                    if assert.ok {
                        pass += 1;
                    } else {
                        failures.push(AssertFailure {
                            number: assert.number,
                            name: assert.name.clone(),
                            diag: assert.diag.clone(),
                        });
                    }
                }
                None => {
                    if assert.ok {
                        pass += 1;
                    } else {
                        failures.push(AssertFailure {
                            number: assert.number,
                            name: assert.name.clone(),
                            diag: assert.diag.clone(),
                        });
                    }
                }
            }
        }

        let total = self.seen.len() as u64;
        let plan_satisfied = self.plan.map_or(true, |count| total >= count);
        let ok = failures.is_empty() && self.bailout.is_none() && plan_satisfied;

        let summary = FinalResult {
            ok,
            total,
            passed: pass + todos.len() as u64,
            failed: failures.len() as u64,
            skips,
            todos,
            failures,
            bailout: self.bailout.clone(),
        };
        self.summary = Some(summary.clone());
        summary
    }

    fn parse_line(&mut self, line: &str) -> Option<TapEvent> {
        // Diagnostic block between an assertion and the next TAP line.
        if self.in_diag {
            if line.trim() == "..." {
                self.in_diag = false;
            } else if let Some(last) = self.seen.last_mut() {
                let diag = last.diag.get_or_insert_with(String::new);
                if !diag.is_empty() {
                    diag.push('\n');
                }
                diag.push_str(line.trim_end());
            }
            return None;
        }

        if line.trim().is_empty() {
            return None;
        }

        if line.trim() == "---" {
            if !self.seen.is_empty() {
                self.in_diag = true;
            }
            return None;
        }

        if let Some(caps) = version_re().captures(line) {
            let version = caps[1].parse().unwrap_or(13);
            return Some(TapEvent::Version(version));
        }

        if let Some(caps) = plan_re().captures(line) {
            let count: u64 = caps[1].parse().unwrap_or(0);
            self.plan = Some(count);
            return Some(TapEvent::Plan { count });
        }

        if let Some(rest) = line.strip_prefix("Bail out!") {
            let reason = rest.trim().to_string();
            self.bailout = Some(reason.clone());
            return Some(TapEvent::Bailout { reason });
        }

        if line.starts_with('#') {
            return Some(TapEvent::Comment {
                text: line.to_string(),
            });
        }

        if let Some(caps) = assert_re().captures(line) {
            let ok = caps.get(1).is_none();
            let number = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(self.next_number);
            self.next_number = number + 1;
            let name = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();
            let directive = caps.get(4).map(|m| {
                let reason = caps.get(5).map_or("", |r| r.as_str()).trim().to_string();
                if m.as_str().eq_ignore_ascii_case("skip") {
                    Directive::Skip(reason)
                } else {
                    Directive::Todo(reason)
                }
            });

            let assert = Assert {
                ok,
                number,
                name,
                directive,
            };
            self.seen.push(SeenAssert {
                ok: assert.ok,
                number: assert.number,
                name: assert.name.clone(),
                directive: assert.directive.clone(),
                diag: None,
            });
            return Some(TapEvent::Assert(assert));
        }

        // Anything else (framework noise, partial output) is ignored.
        None
    }
}

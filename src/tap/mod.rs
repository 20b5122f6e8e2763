//! TAP (Test Anything Protocol) stream handling.
//!
//! `parser` turns incremental byte chunks into line-level TAP events;
//! `finish` decides when a test run is complete (plan satisfied, bailout,
//! or natural stream end).

pub mod finish;
pub mod parser;

use serde::Serialize;

/// A skipped or TODO-marked assertion, referenced by number and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertNote {
    pub number: u64,
    pub name: String,
}

/// A failing assertion, with any YAML diagnostic block that followed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertFailure {
    pub number: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diag: Option<String>,
}

/// Aggregated outcome of one client's TAP stream.
///
/// Counting rules: a TODO assertion counts as passed exactly once whether it
/// passed or (expectedly) failed; `failed` counts only non-TODO failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub ok: bool,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skips: Vec<AssertNote>,
    pub todos: Vec<AssertNote>,
    pub failures: Vec<AssertFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bailout: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_result_serializes_camel_case() {
        let result = FinalResult {
            ok: true,
            total: 1,
            passed: 1,
            failed: 0,
            skips: vec![],
            todos: vec![],
            failures: vec![],
            bailout: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"passed\":1"));
        assert!(!json.contains("bailout"));
    }
}

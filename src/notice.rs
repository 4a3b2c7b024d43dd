//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`, `skip_notice`.
//! Role: Shared contract helper for CLI diagnostics such as skipped search-path entries.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{Map, Value, json};

use crate::core::exec::SkipDiagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

pub fn skip_notice(skip: &SkipDiagnostic, time: String) -> Notice {
    let mut details = Map::new();
    details.insert("entry".to_string(), json!(skip.entry));
    details.insert("candidate_len".to_string(), json!(skip.candidate_len));
    details.insert(
        "max_len".to_string(),
        json!(crate::core::exec::MAX_CANDIDATE_LEN),
    );
    Notice {
        kind: "path_entry_skipped".to_string(),
        time,
        cmd: "exec".to_string(),
        message: "search path entry too long, skipped".to_string(),
        details,
    }
}

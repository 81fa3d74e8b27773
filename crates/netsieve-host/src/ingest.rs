//! JSON-lines request ingestion
//!
//! Each input line is a raw request event plus an optional `request_id`.
//! Each output line is the verdict, or an error for requests that could
//! not be classified:
//!
//! ```text
//! {"request_id": 7, "url": "https://ads.example.com/a.js", "resource_type": "script"}
//! {"verdict":"block","matched_rule_id":1,"request_id":7}
//! ```

use netsieve::{DecisionEngine, RawRequest};
use serde_json::{json, Value};
use tracing::debug;

/// Decide one input line. Blank lines produce no output.
pub fn process_line(engine: &DecisionEngine, line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Some(error_line(None, "malformed", &e)),
    };
    let request_id = value
        .as_object_mut()
        .and_then(|fields| fields.remove("request_id"));

    let raw: RawRequest = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return Some(error_line(request_id, "malformed", &e)),
    };

    let mut out = match engine.classify_and_decide(&raw) {
        Ok(verdict) => serde_json::to_value(&verdict)
            .unwrap_or_else(|e| json!({ "error": "internal", "message": e.to_string() })),
        Err(e) => {
            debug!(url = %raw.url, "Unclassifiable request: {}", e);
            return Some(error_line(request_id, "classification", &e));
        }
    };
    if let (Some(id), Some(fields)) = (request_id, out.as_object_mut()) {
        fields.insert("request_id".to_string(), id);
    }
    Some(out)
}

fn error_line(request_id: Option<Value>, kind: &str, error: &dyn std::fmt::Display) -> Value {
    let mut out = json!({ "error": kind, "message": error.to_string() });
    if let (Some(id), Some(fields)) = (request_id, out.as_object_mut()) {
        fields.insert("request_id".to_string(), id);
    }
    out
}

//! Finds tool-call directives in free-form model output.
//!
//! Two shapes are recognised anywhere in the text:
//!
//! ```text
//! tools/call <server> <tool> {"json": "object"}
//! tools/call <tool> {"json": "object"}
//! ```

use crate::domain::types::ToolCallRequest;
use crate::infrastructure::model::NativeToolCall;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

static QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tools/call\s+([A-Za-z0-9_.-]+)\s+([A-Za-z0-9_.-]+)\s*\{")
        .expect("valid regex")
});

static UNQUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tools/call\s+([A-Za-z0-9_.-]+)\s*\{")
        .expect("valid regex")
});

pub struct ToolCallExtractor;

impl ToolCallExtractor {
    /// Every directive in `text`, in order of appearance.
    ///
    /// Malformed JSON drops only the directive it belongs to. Text inside a
    /// qualified directive is never matched again as an unqualified one.
    pub fn extract(text: &str) -> Vec<ToolCallRequest> {
        let mut found: Vec<(usize, ToolCallRequest)> = Vec::new();
        let mut covered: Vec<(usize, usize)> = Vec::new();

        for caps in QUALIFIED.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if is_covered(&covered, whole.start()) {
                continue;
            }
            let name = format!("{}.{}", &caps[1], &caps[2]);
            match parse_object(text, whole.end() - 1) {
                Some((arguments, end)) => {
                    covered.push((whole.start(), end));
                    found.push((whole.start(), ToolCallRequest::new(name, arguments)));
                }
                None => {
                    debug!(tool = %name, "Dropping directive with malformed arguments");
                    covered.push((whole.start(), whole.end()));
                }
            }
        }

        for caps in UNQUALIFIED.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if is_covered(&covered, whole.start()) {
                continue;
            }
            match parse_object(text, whole.end() - 1) {
                Some((arguments, end)) => {
                    covered.push((whole.start(), end));
                    found.push((whole.start(), ToolCallRequest::new(&caps[1], arguments)));
                }
                None => debug!(tool = &caps[1], "Dropping directive with malformed arguments"),
            }
        }

        found.sort_by_key(|(offset, _)| *offset);
        found.into_iter().map(|(_, request)| request).collect()
    }

    /// Requests from a model's structured `tool_calls`; unusable entries are dropped.
    pub fn from_native(calls: &[NativeToolCall]) -> Vec<ToolCallRequest> {
        calls
            .iter()
            .filter_map(|call| {
                let arguments = match &call.arguments {
                    Value::Object(map) => map.clone(),
                    Value::Null => Map::new(),
                    Value::String(raw) if raw.trim().is_empty() => Map::new(),
                    Value::String(raw) => match serde_json::from_str::<Map<String, Value>>(raw) {
                        Ok(map) => map,
                        Err(err) => {
                            debug!(tool = %call.name, %err, "Dropping native call with unparsable arguments");
                            return None;
                        }
                    },
                    other => {
                        debug!(tool = %call.name, arguments = %other, "Dropping native call with non-object arguments");
                        return None;
                    }
                };
                Some(ToolCallRequest::new(call.name.clone(), arguments))
            })
            .collect()
    }

    /// Render a request in directive syntax; `server.tool` names use the qualified form.
    pub fn format_directive(request: &ToolCallRequest) -> String {
        let arguments = Value::Object(request.arguments.clone());
        match request.tool_name.split_once('.') {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
                format!("tools/call {server} {tool} {arguments}")
            }
            _ => format!("tools/call {} {arguments}", request.tool_name),
        }
    }
}

fn is_covered(spans: &[(usize, usize)], offset: usize) -> bool {
    spans
        .iter()
        .any(|&(start, end)| offset >= start && offset < end)
}

/// Parse the JSON object starting at `brace`; returns it with the offset just past it.
fn parse_object(text: &str, brace: usize) -> Option<(Map<String, Value>, usize)> {
    let mut stream = serde_json::Deserializer::from_str(text.get(brace..)?)
        .into_iter::<Map<String, Value>>();
    match stream.next() {
        Some(Ok(map)) => Some((map, brace + stream.byte_offset())),
        _ => None,
    }
}

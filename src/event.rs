//! Structured event records and the argument formatter
//!
//! Every observed call becomes one [`Event`], serialized as exactly one
//! JSON object per line. The formatter bounds every string it emits,
//! redacts secret-bearing keys, and extracts the salient argument of each
//! call into a typed field (`path`, `file`, `command`, `host`, …).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Cap for payload strings
pub const MAX_STRING: usize = 500;
/// Cap for host names
pub const MAX_HOST: usize = 300;
/// Cap for shell command strings
pub const MAX_COMMAND: usize = 400;
/// Cap for individual argv elements
pub const MAX_ARGV_ELEM: usize = 200;
/// Stack renderings keep at most this many lines
pub const MAX_STACK_LINES: usize = 12;
/// …and at most this many characters
pub const MAX_STACK_CHARS: usize = 2000;

const MAX_DEPTH: usize = 3;
const MAX_ARRAY_ELEMS: usize = 20;
const MAX_OBJECT_KEYS: usize = 40;

const SENSITIVE_KEY_PARTS: [&str; 6] = ["pass", "token", "secret", "auth", "cookie", "session"];

/// Operation category, used for summary counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Fs,
    Proc,
    Dns,
    Net,
    Tamper,
}

/// Outcome of the wrapped call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallResult {
    Ok,
    Error,
}

/// Error detail carried on `result=error` records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: truncate(name, MAX_ARGV_ELEM),
            message: truncate(message, MAX_STRING),
        }
    }
}

/// One observed call, one log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: u64,
    pub session: String,
    pub pid: u32,
    pub ppid: u32,
    pub pkg: String,
    pub op: String,
    pub category: Category,
    pub args: Value,
    pub result: CallResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Event {
    /// Serialize as a single JSONL line including the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// How to summarize the first argument(s) of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// First argument is a filesystem path
    FsPath,
    /// `(file, argv[, options])` process launch
    Spawn,
    /// `(command[, options])` shell execution
    Shell,
    /// First argument is a host name
    Dns,
    /// `(port, host)` or `({port, host})` connection
    Net,
    /// `(url | options)` HTTP submission
    Http,
    /// No salient argument
    None,
}

/// Truncate to `cap` characters, suffixing a single ellipsis when cut
pub fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(cap).collect();
        out.push('…');
        out
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|p| lower.contains(p))
}

/// Redact and bound a JSON value: secret keys become `"<redacted>"`,
/// recursion stops at depth 3, arrays at 20 elements, objects at 40 keys.
pub fn redact(value: &Value) -> Value {
    redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, MAX_STRING)),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return Value::String("…".to_string());
            }
            Value::Array(
                items
                    .iter()
                    .take(MAX_ARRAY_ELEMS)
                    .map(|v| redact_at(v, depth + 1))
                    .collect(),
            )
        }
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return Value::String("…".to_string());
            }
            let mut out = Map::new();
            for (k, v) in map.iter().take(MAX_OBJECT_KEYS) {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String("<redacted>".to_string()));
                } else {
                    out.insert(k.clone(), redact_at(v, depth + 1));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn value_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str)
}

fn argv_strings(v: Option<&Value>) -> Option<Vec<String>> {
    let arr = v?.as_array()?;
    Some(
        arr.iter()
            .take(MAX_ARRAY_ELEMS)
            .map(|e| match e {
                Value::String(s) => truncate(s, MAX_ARGV_ELEM),
                other => truncate(&other.to_string(), MAX_ARGV_ELEM),
            })
            .collect(),
    )
}

/// Build the bounded, redacted `args` field for one call.
///
/// The full argument vector is always retained under `argv` in redacted
/// form; the salient argument is additionally lifted into a typed field
/// per the operation's shape.
pub fn summarize(shape: ArgShape, args: &[Value]) -> Value {
    let mut out = Map::new();
    match shape {
        ArgShape::FsPath => {
            if let Some(path) = value_str(args.first()) {
                out.insert("path".into(), Value::String(truncate(path, MAX_STRING)));
            }
        }
        ArgShape::Spawn => {
            if let Some(file) = value_str(args.first()) {
                out.insert("file".into(), Value::String(truncate(file, MAX_COMMAND)));
            }
            if let Some(argv) = argv_strings(args.get(1)) {
                out.insert("argv".into(), json!(argv));
            }
        }
        ArgShape::Shell => {
            if let Some(cmd) = value_str(args.first()) {
                out.insert("command".into(), Value::String(truncate(cmd, MAX_COMMAND)));
            }
        }
        ArgShape::Dns => {
            if let Some(host) = value_str(args.first()) {
                out.insert("host".into(), Value::String(truncate(host, MAX_HOST)));
            }
        }
        ArgShape::Net => summarize_net(args, &mut out),
        ArgShape::Http => summarize_http(args, &mut out),
        ArgShape::None => {}
    }
    if shape != ArgShape::Spawn {
        out.insert("argv".into(), redact(&Value::Array(args.to_vec())));
    }
    Value::Object(out)
}

fn summarize_net(args: &[Value], out: &mut Map<String, Value>) {
    match args.first() {
        Some(Value::Object(opts)) => {
            if let Some(host) = value_str(opts.get("host")) {
                out.insert("host".into(), Value::String(truncate(host, MAX_HOST)));
            }
            if let Some(port) = opts.get("port").and_then(Value::as_u64) {
                out.insert("port".into(), json!(port));
            }
        }
        Some(Value::Number(port)) => {
            out.insert("port".into(), Value::Number(port.clone()));
            if let Some(host) = value_str(args.get(1)) {
                out.insert("host".into(), Value::String(truncate(host, MAX_HOST)));
            }
        }
        _ => {}
    }
}

fn summarize_http(args: &[Value], out: &mut Map<String, Value>) {
    match args.first() {
        Some(Value::String(href)) => {
            out.insert("href".into(), Value::String(truncate(href, MAX_STRING)));
        }
        Some(Value::Object(opts)) => {
            for key in ["host", "hostname"] {
                if let Some(v) = value_str(opts.get(key)) {
                    out.insert(key.into(), Value::String(truncate(v, MAX_HOST)));
                }
            }
            if let Some(method) = value_str(opts.get("method")) {
                out.insert(
                    "method".into(),
                    Value::String(truncate(method, MAX_ARGV_ELEM)),
                );
            }
        }
        _ => {}
    }
}

//! Per-account JSONL audit log
//!
//! Every tracing event is appended to a JSON-lines file owned by one account,
//! so several engines can run side by side without sharing a file.
//!
//! ```text
//! logs/
//! ├── 2026-10-17_alice.jsonl
//! └── 2026-10-17_bob.jsonl
//! ```
//!
//! ```ignore
//! use hivechat_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(JsonlLayer::new("./logs", "bob")?)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! Query with jq: `jq 'select(.level == "warn")' logs/*.jsonl`

use std::fmt::Write as FmtWrite;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One line of the log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    pub level: String,
    pub account: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Span scope, outermost first, joined with ` > `
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        account: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            account: account.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }
}

/// Append-only writer for one account's daily file.
pub struct AccountLogWriter {
    account: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AccountLogWriter {
    pub fn new(logs_dir: impl AsRef<Path>, account: impl Into<String>) -> std::io::Result<Self> {
        let account = account.into();
        fs::create_dir_all(logs_dir.as_ref())?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir
            .as_ref()
            .join(format!("{}_{}.jsonl", date, account));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            account,
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }
}

/// Read every entry of every `.jsonl` file in `logs_dir`, oldest first.
///
/// Lines that do not parse are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    if !logs_dir.as_ref().exists() {
        return Ok(entries);
    }
    for dir_entry in fs::read_dir(logs_dir.as_ref())? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            if let Ok(entry) = serde_json::from_str::<LogEntry>(&line?) {
                entries.push(entry);
            }
        }
    }
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

/// Tracing layer writing events to an [`AccountLogWriter`].
#[derive(Clone)]
pub struct JsonlLayer {
    writer: Arc<AccountLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, account: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(AccountLogWriter::new(logs_dir, account)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = LogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.account(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry.fields = Some(Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry.span = Some(spans.join(" > "));
            }
        }

        // Logging must never take the process down.
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

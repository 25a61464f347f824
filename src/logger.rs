use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::diff::diff_flat;
use crate::types::StatusRecord;

/// How parsed status records are written to the message log. Raw requests
/// and responses are always logged in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    Full,
    /// First status in full, afterwards only the fields that changed.
    Diffed,
}

pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    last_status: Option<Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            last_status: None,
        })
    }

    pub fn log_request(&mut self, host: &str, seq: u32, xml: &str) {
        self.append("req", json!({ "host": host, "seq": seq, "xml": xml }));
    }

    pub fn log_response(&mut self, host: &str, seq: Option<u32>, xml: &str) {
        self.append("resp", json!({ "host": host, "seq": seq, "xml": xml }));
    }

    /// Parsed status. In diffed mode only the first record is written whole.
    pub fn log_status(&mut self, status: &StatusRecord) {
        let body = serde_json::to_value(status).unwrap_or(Value::Null);
        let fields = match (self.mode, self.last_status.as_ref()) {
            (MessageLogMode::Diffed, Some(last)) => {
                let changes: Vec<Value> = diff_flat(last, &body)
                    .into_iter()
                    .map(|(field, old, new)| json!({ "field": field, "old": old, "new": new }))
                    .collect();
                json!({ "changes": changes })
            }
            (MessageLogMode::Diffed, None) => json!({ "full": true, "body": body }),
            (MessageLogMode::Full, _) => json!({ "body": body }),
        };
        self.append("status", fields);
        self.last_status = Some(body);
    }

    fn append(&mut self, dir: &str, mut fields: Value) {
        if let Value::Object(map) = &mut fields {
            map.insert("ts".into(), Utc::now().to_rfc3339().into());
            map.insert("dir".into(), dir.into());
        }
        match serde_json::to_string(&fields) {
            Ok(line) => {
                if let Err(e) = writeln!(self.file, "{line}") {
                    warn!(error = %e, "message log write failed");
                }
            }
            Err(e) => warn!(error = %e, "message log entry not serializable"),
        }
    }
}

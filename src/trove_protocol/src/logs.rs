use ic_canister_log::{declare_log_buffer, export as export_logs};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// High-priority messages: every state transition of a trove or pool.
declare_log_buffer!(name = INFO, capacity = 1000);

// Low-priority messages: hint corrections, skipped troves, settlement details.
declare_log_buffer!(name = DEBUG, capacity = 1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Info,
    Debug,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Priority::Info),
            "debug" => Ok(Priority::Debug),
            _ => Err(format!("unknown log priority: {s}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub priority: Priority,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub counter: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Log {
    pub entries: Vec<LogEntry>,
}

impl Log {
    pub fn push_logs(&mut self, priority: Priority) {
        let logs = match priority {
            Priority::Info => export_logs(&INFO),
            Priority::Debug => export_logs(&DEBUG),
        };
        for entry in logs {
            self.entries.push(LogEntry {
                timestamp: entry.timestamp,
                counter: entry.counter,
                priority,
                file: entry.file.to_string(),
                line: entry.line,
                message: entry.message,
            });
        }
    }

    pub fn push_all(&mut self) {
        self.push_logs(Priority::Info);
        self.push_logs(Priority::Debug);
    }

    /// Keeps only the entries whose message contains `needle`.
    pub fn filter_message(&mut self, needle: &str) {
        self.entries.retain(|e| e.message.contains(needle));
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

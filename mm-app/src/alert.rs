//! Keyword-triggered suspension state and the operator manual-message queue.

use chrono::{DateTime, Utc};
use mm_transport::MessageId;
use std::collections::VecDeque;

const ALERT_SNIPPET_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub keyword: String,
    pub snippet: String,
    pub sender: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct AlertState {
    triggered: bool,
    records: Vec<AlertRecord>,
}

impl AlertState {
    /// Record a keyword hit. Returns true only on the Armed -> Suspended
    /// transition; repeat hits append a record without re-transitioning.
    pub fn trigger(
        &mut self,
        keyword: &str,
        message_text: &str,
        sender: &str,
        at: DateTime<Utc>,
    ) -> bool {
        let newly = !self.triggered;
        self.triggered = true;
        self.records.push(AlertRecord {
            keyword: keyword.to_string(),
            snippet: truncate_chars(message_text, ALERT_SNIPPET_MAX_CHARS),
            sender: sender.to_string(),
            at,
        });
        newly
    }

    /// Idempotent clearance; returns true when the state was suspended.
    pub fn clear(&mut self) -> bool {
        let was = self.triggered;
        self.triggered = false;
        self.records.clear();
        was
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn records(&self) -> &[AlertRecord] {
        &self.records
    }
}

/// Case-insensitive substring scan; the first matching keyword wins.
pub fn scan_keywords<'a>(text: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lowered = text.to_lowercase();
    keywords
        .iter()
        .find(|keyword| !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()))
        .map(String::as_str)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Operator-authored message awaiting delivery, outside all gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualMessage {
    pub text: String,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Default)]
pub struct ManualQueue {
    entries: VecDeque<ManualMessage>,
}

impl ManualQueue {
    pub fn enqueue(&mut self, text: String, reply_to: Option<MessageId>) {
        self.entries.push_back(ManualMessage { text, reply_to });
    }

    /// Pops the earliest entry; each entry is consumed exactly once.
    pub fn dequeue(&mut self) -> Option<ManualMessage> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

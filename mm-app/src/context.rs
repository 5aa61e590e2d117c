//! Bounded per-conversation history of recent exchanged lines.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Role tag for the agent's own turns.
pub const SELF_ROLE: &str = "me";

#[derive(Debug, Clone)]
pub struct ContextLine {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ContextLine {
    /// `[HH:MM] role: content`, the shape the generation prompt consumes.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.at.format("%H:%M"),
            self.role,
            self.content
        )
    }
}

#[derive(Debug, Default)]
pub struct ContextWindow {
    lines: VecDeque<ContextLine>,
}

impl ContextWindow {
    /// Append a line, evicting exactly the oldest entry beyond `cap`.
    pub fn push(&mut self, role: &str, content: &str, at: DateTime<Utc>, cap: usize) {
        self.lines.push_back(ContextLine {
            role: role.to_string(),
            content: content.to_string(),
            at,
        });
        while self.lines.len() > cap {
            self.lines.pop_front();
        }
    }

    /// The most recent `limit` lines in insertion order.
    pub fn tail(&self, limit: usize) -> Vec<ContextLine> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

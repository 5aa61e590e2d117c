//! Per-conversation sliding window of recent senders.
//!
//! Gates automated participation to conversations that are actually alive:
//! a bounded record of who spoke recently, counted fresh on every query.

use chrono::{DateTime, Duration, Utc};
use mm_transport::SenderId;
use std::collections::{HashSet, VecDeque};

pub const SENDER_WINDOW_CAP: usize = 50;

#[derive(Debug, Clone)]
struct SenderRecord {
    sender_id: SenderId,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SenderWindow {
    records: VecDeque<SenderRecord>,
}

impl SenderWindow {
    /// O(1) amortized append; the oldest record is evicted at the cap.
    pub fn record(&mut self, sender_id: SenderId, at: DateTime<Utc>) {
        if self.records.len() == SENDER_WINDOW_CAP {
            self.records.pop_front();
        }
        self.records.push_back(SenderRecord { sender_id, at });
    }

    /// Distinct senders seen within the lookback window, computed fresh.
    pub fn active_user_count(&self, window_minutes: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(window_minutes);
        let mut seen: HashSet<&str> = HashSet::new();
        for record in &self.records {
            if record.at >= cutoff {
                seen.insert(record.sender_id.as_str());
            }
        }
        seen.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn distinct_senders_are_counted_once() {
        let mut window = SenderWindow::default();
        window.record(SenderId::from("a"), at(0));
        window.record(SenderId::from("b"), at(1));
        window.record(SenderId::from("a"), at(2));
        assert_eq!(window.active_user_count(10, at(5)), 2);
    }

    #[test]
    fn count_is_monotonically_non_increasing_as_window_shrinks() {
        let mut window = SenderWindow::default();
        for (i, sender) in ["a", "b", "c", "d"].iter().enumerate() {
            window.record(SenderId::from(*sender), at(i as u32 * 10));
        }
        let now = at(35);
        let mut previous = usize::MAX;
        for minutes in [60, 30, 20, 10, 5, 1] {
            let count = window.active_user_count(minutes, now);
            assert!(count <= previous, "window={minutes} grew the count");
            previous = count;
        }
    }

    #[test]
    fn stale_records_fall_outside_the_window() {
        let mut window = SenderWindow::default();
        window.record(SenderId::from("a"), at(0));
        window.record(SenderId::from("b"), at(20));
        assert_eq!(window.active_user_count(10, at(25)), 1);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let mut window = SenderWindow::default();
        for i in 0..(SENDER_WINDOW_CAP + 10) {
            window.record(SenderId::from(format!("s{i}")), at(0));
        }
        assert_eq!(window.len(), SENDER_WINDOW_CAP);
        // The ten oldest senders were evicted, the newest survive.
        assert_eq!(window.active_user_count(10, at(1)), SENDER_WINDOW_CAP);
    }
}

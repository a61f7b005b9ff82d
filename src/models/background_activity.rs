//! # Background Activities
//!
//! Batched, resumable multi-item jobs unrelated to remote clusters. Each item
//! is processed and the position persisted before moving to the next, so a
//! crashed driver resumes at the first unprocessed item.
//!
//! Status changes go through the same compare-and-set discipline as tasks,
//! at the coarser grain of one activity record.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ActivityId = i64;

/// Minimum delay between two retries of a failed activity
pub const MIN_RETRY_DELAY_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
    InternalError,
    Cancelled,
    Suspended,
    Scheduled,
    CancelledScheduled,
    SuspendedScheduled,
}

impl ActivityStatus {
    pub const ALL: [ActivityStatus; 10] = [
        Self::InProgress,
        Self::Completed,
        Self::PartiallyCompleted,
        Self::Failed,
        Self::InternalError,
        Self::Cancelled,
        Self::Suspended,
        Self::Scheduled,
        Self::CancelledScheduled,
        Self::SuspendedScheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Failed => "Failed",
            Self::InternalError => "InternalError",
            Self::Cancelled => "Cancelled",
            Self::Suspended => "Suspended",
            Self::Scheduled => "Scheduled",
            Self::CancelledScheduled => "CancelledScheduled",
            Self::SuspendedScheduled => "SuspendedScheduled",
        }
    }

    /// No driver will pick this activity up again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::PartiallyCompleted
                | Self::Failed
                | Self::InternalError
                | Self::Cancelled
                | Self::CancelledScheduled
        )
    }

    /// Target status of a cancel request, if cancelling applies
    pub fn cancelled(&self) -> Option<ActivityStatus> {
        match self {
            Self::InProgress | Self::Suspended => Some(Self::Cancelled),
            Self::Scheduled | Self::SuspendedScheduled => Some(Self::CancelledScheduled),
            _ => None,
        }
    }

    pub fn suspended(&self) -> Option<ActivityStatus> {
        match self {
            Self::InProgress => Some(Self::Suspended),
            Self::Scheduled => Some(Self::SuspendedScheduled),
            _ => None,
        }
    }

    pub fn unsuspended(&self) -> Option<ActivityStatus> {
        match self {
            Self::Suspended => Some(Self::InProgress),
            Self::SuspendedScheduled => Some(Self::Scheduled),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid activity status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundActivity {
    pub activity_id: ActivityId,
    /// Selects the handler in the activity registry
    pub activity_type: String,
    pub user_id: i64,
    pub endpoint_id: i64,
    pub status: ActivityStatus,
    pub handler_lock: Option<String>,
    pub items: Vec<String>,
    /// Index of the first unprocessed item
    pub current_item: usize,
    pub num_successes: usize,
    pub num_failures: usize,
    /// Per-item outcome message, indexed like `items`
    pub messages: Vec<Option<String>>,
    pub failed_indices: Vec<usize>,
    pub options: serde_json::Value,
    pub retry_count: u32,
    pub retry_delay_secs: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundActivity {
    pub fn new(
        activity_type: impl Into<String>,
        user_id: i64,
        endpoint_id: i64,
        items: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            activity_id: 0,
            activity_type: activity_type.into(),
            user_id,
            endpoint_id,
            status: ActivityStatus::InProgress,
            handler_lock: None,
            items,
            current_item: 0,
            num_successes: 0,
            num_failures: 0,
            messages: Vec::new(),
            failed_indices: Vec::new(),
            options: serde_json::Value::Object(serde_json::Map::new()),
            retry_count: 0,
            retry_delay_secs: MIN_RETRY_DELAY_SECS,
            start_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Park the activity until `start_at`
    pub fn scheduled_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.status = ActivityStatus::Scheduled;
        self.start_at = Some(start_at);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay_secs: i64) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_secs = retry_delay_secs.max(MIN_RETRY_DELAY_SECS);
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn next_item(&self) -> Option<&str> {
        self.items.get(self.current_item).map(String::as_str)
    }

    pub fn all_items_processed(&self) -> bool {
        self.current_item >= self.items.len()
    }

    /// Record the outcome of the current item and advance the position
    pub fn record_item_result(&mut self, ok: bool, message: Option<String>) {
        let idx = self.current_item;
        if self.messages.len() <= idx {
            self.messages.resize(idx + 1, None);
        }
        self.messages[idx] = message;
        if ok {
            self.num_successes += 1;
        } else {
            self.num_failures += 1;
            self.failed_indices.push(idx);
        }
        self.current_item = idx + 1;
    }

    /// Final status once every item has been processed
    pub fn outcome_status(&self) -> ActivityStatus {
        match (self.num_successes, self.num_failures) {
            (_, 0) => ActivityStatus::Completed,
            (0, _) => ActivityStatus::Failed,
            _ => ActivityStatus::PartiallyCompleted,
        }
    }

    /// Reset for another attempt on the failed items only.
    ///
    /// Returns `false` when no retry is left. The delay doubles at every
    /// retry and never drops under [`MIN_RETRY_DELAY_SECS`].
    pub fn prepare_retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.retry_count == 0 || self.failed_indices.is_empty() {
            return false;
        }
        let retry_items: Vec<String> = self
            .failed_indices
            .iter()
            .filter_map(|&i| self.items.get(i).cloned())
            .collect();
        if retry_items.is_empty() {
            return false;
        }

        let delay = self.retry_delay_secs.max(MIN_RETRY_DELAY_SECS);
        self.retry_count -= 1;
        self.retry_delay_secs = delay * 2;
        self.items = retry_items;
        self.current_item = 0;
        self.num_successes = 0;
        self.num_failures = 0;
        self.messages.clear();
        self.failed_indices.clear();
        self.start_at = Some(now + ChronoDuration::seconds(delay));
        self.status = ActivityStatus::Scheduled;
        true
    }

    /// Most frequent non-trivial messages, formatted `"{count}x {message}"`
    pub fn uniq_counted_messages(&self) -> Vec<String> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for message in self.messages.iter().flatten() {
            let trimmed = message.trim();
            if trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            match counts.iter_mut().find(|(m, _)| m == trimmed) {
                Some((_, count)) => *count += 1,
                None => counts.push((trimmed.to_string(), 1)),
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts
            .into_iter()
            .take(5)
            .map(|(m, c)| format!("{c}x {m}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(items: &[&str]) -> BackgroundActivity {
        BackgroundActivity::new(
            "copy_files",
            1,
            1,
            items.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_outcome_status_from_counters() {
        let mut bac = activity(&["a", "b"]);
        bac.record_item_result(true, None);
        bac.record_item_result(true, None);
        assert!(bac.all_items_processed());
        assert_eq!(bac.outcome_status(), ActivityStatus::Completed);

        let mut bac = activity(&["a", "b"]);
        bac.record_item_result(true, None);
        bac.record_item_result(false, Some("boom".into()));
        assert_eq!(bac.outcome_status(), ActivityStatus::PartiallyCompleted);

        let mut bac = activity(&["a"]);
        bac.record_item_result(false, None);
        assert_eq!(bac.outcome_status(), ActivityStatus::Failed);
    }

    #[test]
    fn test_prepare_retry_keeps_only_failed_items() {
        let mut bac = activity(&["a", "b", "c"]).with_retries(2, 10);
        bac.record_item_result(true, None);
        bac.record_item_result(false, Some("nope".into()));
        bac.record_item_result(false, Some("nope".into()));

        let now = Utc::now();
        assert!(bac.prepare_retry(now));
        assert_eq!(bac.items, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(bac.status, ActivityStatus::Scheduled);
        assert_eq!(bac.retry_count, 1);
        assert_eq!(bac.retry_delay_secs, 2 * MIN_RETRY_DELAY_SECS);
        assert_eq!(bac.start_at, Some(now + ChronoDuration::seconds(MIN_RETRY_DELAY_SECS)));
        assert_eq!(bac.current_item, 0);
    }

    #[test]
    fn test_no_retry_without_count() {
        let mut bac = activity(&["a"]);
        bac.record_item_result(false, None);
        assert!(!bac.prepare_retry(Utc::now()));
        assert_eq!(bac.status, ActivityStatus::InProgress);
    }

    #[test]
    fn test_control_status_mapping() {
        assert_eq!(
            ActivityStatus::Scheduled.cancelled(),
            Some(ActivityStatus::CancelledScheduled)
        );
        assert_eq!(ActivityStatus::Completed.cancelled(), None);
        assert_eq!(
            ActivityStatus::InProgress.suspended(),
            Some(ActivityStatus::Suspended)
        );
        assert_eq!(
            ActivityStatus::SuspendedScheduled.unsuspended(),
            Some(ActivityStatus::Scheduled)
        );
    }

    #[test]
    fn test_uniq_counted_messages_skips_numbers_and_blanks() {
        let mut bac = activity(&["a", "b", "c", "d"]);
        bac.record_item_result(false, Some("disk full".into()));
        bac.record_item_result(false, Some("disk full".into()));
        bac.record_item_result(true, Some("123".into()));
        bac.record_item_result(true, Some("  ".into()));
        assert_eq!(bac.uniq_counted_messages(), vec!["2x disk full".to_string()]);
    }
}

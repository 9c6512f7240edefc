use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

pub const DEFAULT_TIMELINE_LIMIT: usize = 25;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TimelineLevel {
    Error,
    Info,
    Debug,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub level: TimelineLevel,
    pub event: String,
    pub data: Value,
}

/// Bounded log of a connection's internal events, oldest first.
///
/// Entries beyond the limit push out the oldest ones. Delivering the log anywhere is up
/// to the caller, typically by calling [`Timeline::drain`] periodically.
#[derive(Debug)]
pub struct Timeline {
    limit: usize,
    entries: Mutex<VecDeque<TimelineEntry>>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_LIMIT)
    }
}

impl Timeline {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn log<S: Into<String>>(&self, level: TimelineLevel, event: S, data: Value) {
        if self.limit == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(TimelineEntry {
            timestamp: Utc::now(),
            level,
            event: event.into(),
            data,
        });
    }

    pub fn info<S: Into<String>>(&self, event: S, data: Value) {
        self.log(TimelineLevel::Info, event, data);
    }

    pub fn error<S: Into<String>>(&self, event: S, data: Value) {
        self.log(TimelineLevel::Error, event, data);
    }

    /// Copy of the current entries.
    #[must_use]
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<TimelineEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

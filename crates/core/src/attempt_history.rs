use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub run: u64,
    pub candidate: String,
    pub outcome: TrialOutcome,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

pub const MAX_HISTORY_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
pub struct AttemptHistory {
    capacity: usize,
    records: VecDeque<TrialRecord>,
}

impl Default for AttemptHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl AttemptHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(1, MAX_HISTORY_CAPACITY),
            records: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&mut self, record: TrialRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<TrialRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }
}

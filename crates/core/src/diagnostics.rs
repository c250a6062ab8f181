use serde::{Deserialize, Serialize};

use crate::attempt_history::TrialRecord;

pub const INITIAL_ERROR: &str = "Initializing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionState {
    pub connected: bool,
    pub active_candidate_name: Option<String>,
    pub last_error: Option<String>,
    pub run: u64,
}

impl Default for ResolutionState {
    fn default() -> Self {
        Self {
            connected: false,
            active_candidate_name: None,
            last_error: Some(INITIAL_ERROR.to_string()),
            run: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub run: u64,
    pub connected: bool,
    pub strategy: Option<String>,
    pub error: Option<String>,
    pub attempted: Vec<String>,
}

impl ResolutionOutcome {
    #[must_use]
    pub fn connected(run: u64, strategy: impl Into<String>, attempted: Vec<String>) -> Self {
        Self {
            run,
            connected: true,
            strategy: Some(strategy.into()),
            error: None,
            attempted,
        }
    }

    #[must_use]
    pub fn failed(run: u64, error: impl Into<String>, attempted: Vec<String>) -> Self {
        Self {
            run,
            connected: false,
            strategy: None,
            error: Some(error.into()),
            attempted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub connected: bool,
    pub strategy: Option<String>,
    pub error: Option<String>,
    pub manual_override_set: bool,
    pub candidate_names: Vec<String>,
    #[serde(default)]
    pub resolving: bool,
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub recent_attempts: Vec<TrialRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub is_db_connected: bool,
    pub db_error: Option<String>,
}

// `success` only says the request was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub success: bool,
    pub message: String,
    pub connected: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionReport {
    #[must_use]
    pub fn from_outcome(
        outcome: &ResolutionOutcome,
        connected_message: &str,
        failed_message: &str,
    ) -> Self {
        Self {
            success: true,
            message: if outcome.connected {
                connected_message.to_string()
            } else {
                failed_message.to_string()
            },
            connected: outcome.connected,
            error: outcome.error.clone(),
        }
    }
}

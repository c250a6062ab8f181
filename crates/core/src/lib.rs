pub mod attempt_history;
pub mod candidates;
pub mod config;
pub mod connection_manager;
pub mod diagnostics;
pub mod journal;
pub mod migration;
pub mod override_store;
pub mod trial;

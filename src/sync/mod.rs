//! Synchronisation of job definitions and kill signals from the store.

pub mod agent;

pub use agent::{SyncAgent, SyncTasks};

//! Management side: job CRUD and kill requests, plus their HTTP API.

pub mod api;
pub mod manager;

pub use api::{router, run_api, ApiResponse};
pub use manager::JobManager;

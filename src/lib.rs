pub mod config;
pub mod error;
pub mod job;
pub mod master;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod worker;

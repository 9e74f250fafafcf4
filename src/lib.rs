pub mod agent;
pub mod config;
pub mod error;
pub mod indexer;
pub mod notify;
pub mod queue;
pub mod store;
pub mod sync;
pub mod worker;

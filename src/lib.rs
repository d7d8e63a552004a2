pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod notify;
pub mod results;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

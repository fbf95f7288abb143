pub mod app;
pub mod catalog;
pub mod certificates;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod routes;
pub mod store;
pub mod tracker;

pub use app::AppState;
pub use error::{ApiError, ProgressError, StorageError};
pub use orchestrator::CompletionOrchestrator;

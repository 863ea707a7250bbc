use std::sync::Arc;

use cache::CounterStore;
use database::RecordStore;
use scheduler::Scheduler;

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod rate_limit;
pub mod router;
pub mod routes;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub counters: Arc<dyn CounterStore>,
    pub scheduler: Arc<Scheduler>,
}

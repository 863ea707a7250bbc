mod handler;
mod model;

pub use handler::{ingest_status, ingest_statuses, trigger_ingest};
pub use model::TriggerQuery;

mod handler;
mod model;

pub use handler::recent_records;
pub use model::{DatasetMeta, DatasetPage, RecentQuery};

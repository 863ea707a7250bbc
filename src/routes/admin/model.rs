use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ingest::{MAX_WINDOW_DAYS, Window};

/// Window selection for a manual run: an explicit `start`/`end` pair, a
/// trailing number of `days`, or neither for the dataset's default lookback.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub days: Option<i64>,
}

impl TriggerQuery {
    pub fn window(&self, now: DateTime<Utc>) -> Result<Option<Window>> {
        match (self.start, self.end, self.days) {
            (None, None, None) => Ok(None),
            (Some(start), Some(end), None) => Window::new(start, end).map(Some),
            (None, None, Some(days)) if (1..=MAX_WINDOW_DAYS).contains(&days) => {
                Window::trailing(now, chrono::Duration::days(days)).map(Some)
            }
            (None, None, Some(days)) => Err(Error::Configuration(format!(
                "days must be between 1 and {MAX_WINDOW_DAYS}, got {days}"
            ))),
            _ => Err(Error::Configuration(
                "give either both start and end, or days".into(),
            )),
        }
    }
}

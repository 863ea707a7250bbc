//! Synthetic turbidity over a one-degree grid, one reading per cell at
//! 12:00 UTC each day. No upstream call: the "payload" is the window itself
//! and values are seeded from cell and day, so re-runs reproduce them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::error::{Error, Result};
use crate::ingest::datasets::BoundingBox;
use crate::ingest::{DatasetType, Ingester, Record, Window, grid_key};

const SEED: u64 = 42;

pub struct TurbidityDemoIngester {
    bbox: BoundingBox,
}

impl TurbidityDemoIngester {
    pub fn new(bbox: BoundingBox) -> Self {
        Self { bbox }
    }

    /// Integer-degree cell origins covering the bounding box.
    fn cells(&self) -> Vec<(i32, i32)> {
        let lats = (self.bbox.lat_min.floor() as i32)..(self.bbox.lat_max.ceil() as i32);
        let lons = (self.bbox.lon_min.floor() as i32)..(self.bbox.lon_max.ceil() as i32);
        lats.flat_map(|lat| lons.clone().map(move |lon| (lat, lon)))
            .collect()
    }
}

fn rng_for(lat: i32, lon: i32, day: i64) -> StdRng {
    let cell = ((lat as i64 + 90) * 360 + (lon as i64 + 180)) as u64;
    StdRng::seed_from_u64(SEED ^ cell.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (day as u64))
}

#[async_trait]
impl Ingester for TurbidityDemoIngester {
    fn dataset(&self) -> DatasetType {
        DatasetType::Turbidity
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(7)
    }

    async fn fetch(&self, window: &Window, _timeout: Duration) -> Result<Vec<u8>> {
        serde_json::to_vec(window).map_err(|e| Error::Internal(e.to_string()))
    }

    fn normalize(&self, raw: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Record>> {
        let window: Window =
            serde_json::from_slice(raw).map_err(|e| Error::permanent_upstream("turbidity-demo", e))?;
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default();
        let cells = self.cells();

        let mut records = Vec::new();
        let mut date = window.start.date_naive();
        while date <= window.end.date_naive() {
            let time = date.and_time(noon).and_utc();
            if window.contains(time) {
                let day = i64::from(date.num_days_from_ce());
                for &(lat, lon) in &cells {
                    let mut rng = rng_for(lat, lon, day);
                    let ntu: f64 = (5.0 + rng.gen_range(-2.0..3.0_f64)).max(0.1);
                    let ntu = (ntu * 100.0).round() / 100.0;
                    let (lat, lon) = (f64::from(lat) + 0.5, f64::from(lon) + 0.5);
                    records.push(Record::new(
                        grid_key(lat, lon, time),
                        time,
                        json!({
                            "lat": lat,
                            "lon": lon,
                            "time": time.to_rfc3339_opts(SecondsFormat::Secs, true),
                            "ntu": ntu,
                        }),
                        fetched_at,
                    ));
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(records)
    }
}

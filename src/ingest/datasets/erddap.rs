//! Gridded products served by an ERDDAP `griddap` endpoint (sea-surface
//! temperature, surface currents).
//!
//! ERDDAP answers `.json` requests with a column table:
//! `{"table": {"columnNames": [...], "rows": [[...], ...]}}`. Land and
//! missing cells arrive as `null` and are dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ingest::datasets::BoundingBox;
use crate::ingest::{DatasetType, FetchRequest, Ingester, Record, SourceClient, Window, grid_key};

pub const DEFAULT_BASE_URL: &str = "https://coastwatch.pfeg.noaa.gov/erddap";
pub const DEFAULT_SST_DATASET: &str = "jplMURSST41";
pub const DEFAULT_CURRENTS_DATASET: &str = "jplOscar_LonPM180";

const SOURCE: &str = "erddap";

#[derive(Debug, Deserialize)]
struct TableEnvelope {
    table: Table,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Table {
    column_names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// A grid variable and the field name it is stored under.
#[derive(Debug, Clone)]
struct Variable {
    source: &'static str,
    field: &'static str,
}

pub struct ErddapGridIngester {
    dataset: DatasetType,
    client: Arc<dyn SourceClient>,
    base_url: String,
    dataset_id: String,
    variables: Vec<Variable>,
    /// Fixed depth index value for products with a depth axis.
    depth: Option<f64>,
    /// Keep every `stride`-th grid point along lat and lon.
    stride: u32,
    bbox: BoundingBox,
    lookback: chrono::Duration,
}

impl ErddapGridIngester {
    pub fn sst(client: Arc<dyn SourceClient>, base_url: String, dataset_id: String, bbox: BoundingBox) -> Self {
        Self {
            dataset: DatasetType::Sst,
            client,
            base_url,
            dataset_id,
            variables: vec![Variable {
                source: "analysed_sst",
                field: "sst_c",
            }],
            depth: None,
            stride: 25,
            bbox,
            lookback: chrono::Duration::days(2),
        }
    }

    pub fn currents(client: Arc<dyn SourceClient>, base_url: String, dataset_id: String, bbox: BoundingBox) -> Self {
        Self {
            dataset: DatasetType::Currents,
            client,
            base_url,
            dataset_id,
            variables: vec![
                Variable { source: "u", field: "u" },
                Variable { source: "v", field: "v" },
            ],
            depth: Some(15.0),
            stride: 1,
            bbox,
            lookback: chrono::Duration::days(10),
        }
    }

    /// `var[(start):1:(end)][(depth)][(lat0):s:(lat1)][(lon0):s:(lon1)]`, one per variable.
    fn query(&self, window: &Window) -> String {
        let time = format!(
            "[({}):1:({})]",
            window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            window.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let depth = self.depth.map(|d| format!("[({d})]")).unwrap_or_default();
        let lat = format!("[({}):{}:({})]", self.bbox.lat_min, self.stride, self.bbox.lat_max);
        let lon = format!("[({}):{}:({})]", self.bbox.lon_min, self.stride, self.bbox.lon_max);

        self.variables
            .iter()
            .map(|v| format!("{}{time}{depth}{lat}{lon}", v.source))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn request(&self, window: &Window) -> FetchRequest {
        FetchRequest::new(format!(
            "{}/griddap/{}.json?{}",
            self.base_url.trim_end_matches('/'),
            self.dataset_id,
            self.query(window)
        ))
    }
}

#[async_trait]
impl Ingester for ErddapGridIngester {
    fn dataset(&self) -> DatasetType {
        self.dataset
    }

    fn default_lookback(&self) -> chrono::Duration {
        self.lookback
    }

    async fn fetch(&self, window: &Window, timeout: Duration) -> Result<Vec<u8>> {
        self.client.fetch(&self.request(window), timeout).await
    }

    fn normalize(&self, raw: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Record>> {
        let envelope: TableEnvelope =
            serde_json::from_slice(raw).map_err(|e| Error::permanent_upstream(SOURCE, e))?;
        let table = envelope.table;

        let column = |name: &str| {
            table
                .column_names
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| Error::permanent_upstream(SOURCE, format!("missing column {name}")))
        };
        let time_col = column("time")?;
        let lat_col = column("latitude")?;
        let lon_col = column("longitude")?;
        let value_cols = self
            .variables
            .iter()
            .map(|v| column(v.source).map(|i| (v.field, i)))
            .collect::<Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(table.rows.len());
        let mut skipped = 0usize;
        for row in &table.rows {
            let cell = |i: usize| row.get(i);
            let time = cell(time_col)
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
            let lat = cell(lat_col).and_then(Value::as_f64);
            let lon = cell(lon_col).and_then(Value::as_f64);
            let (Some(time), Some(lat), Some(lon)) = (time, lat, lon) else {
                warn!("Skipping malformed {} row: {:?}", self.dataset, row);
                skipped += 1;
                continue;
            };

            let mut fields = Map::new();
            fields.insert("lat".into(), Value::from(lat));
            fields.insert("lon".into(), Value::from(lon));
            fields.insert("time".into(), Value::from(time.to_rfc3339_opts(SecondsFormat::Secs, true)));
            let mut complete = true;
            for (field, index) in &value_cols {
                match cell(*index).and_then(Value::as_f64) {
                    Some(value) => {
                        fields.insert((*field).into(), Value::from(value));
                    }
                    None => complete = false,
                }
            }
            if !complete {
                skipped += 1;
                continue;
            }

            records.push(Record::new(grid_key(lat, lon, time), time, Value::Object(fields), fetched_at));
        }

        if skipped > 0 {
            debug!("{}: dropped {} empty or malformed grid cells", self.dataset, skipped);
        }
        Ok(records)
    }
}

//! NOAA CO-OPS water levels.
//!
//! One datagetter request per station. A station the API rejects is skipped
//! with a warning; a transient failure on any station fails the attempt so
//! the whole window is retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ingest::{DatasetType, FetchRequest, Ingester, Record, SourceClient, Window};

pub const DEFAULT_BASE_URL: &str = "https://api.tidesandcurrents.noaa.gov/api/prod/datagetter";

/// Providence, The Battery (New York), Wilmington.
pub const DEFAULT_STATIONS: [&str; 3] = ["8454000", "8518750", "8574680"];

const SOURCE: &str = "noaa-coops";

#[derive(Debug, Serialize, Deserialize)]
struct StationPayload {
    station_id: String,
    data: serde_json::Value,
}

pub struct TidesIngester {
    client: Arc<dyn SourceClient>,
    base_url: String,
    stations: Vec<String>,
}

impl TidesIngester {
    pub fn new(client: Arc<dyn SourceClient>, base_url: String, stations: Vec<String>) -> Self {
        Self {
            client,
            base_url,
            stations,
        }
    }

    fn request(&self, station: &str, window: &Window) -> FetchRequest {
        FetchRequest::new(&self.base_url)
            .param("station", station)
            .param("begin_date", window.start.format("%Y%m%d %H:%M"))
            .param("end_date", window.end.format("%Y%m%d %H:%M"))
            .param("product", "water_level")
            .param("datum", "MLLW")
            .param("units", "metric")
            .param("time_zone", "gmt")
            .param("format", "json")
            .param("application", "bluetrace")
    }
}

#[async_trait]
impl Ingester for TidesIngester {
    fn dataset(&self) -> DatasetType {
        DatasetType::Tides
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(7)
    }

    async fn fetch(&self, window: &Window, timeout: Duration) -> Result<Vec<u8>> {
        if self.stations.is_empty() {
            return Err(Error::Configuration("no tide stations configured".into()));
        }

        let mut payloads = Vec::with_capacity(self.stations.len());
        let mut last_error = None;
        for station in &self.stations {
            let body = match self.client.fetch(&self.request(station, window), timeout).await {
                Ok(body) => body,
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    warn!("Failed to fetch tides for station {}: {}", station, err);
                    last_error = Some(err);
                    continue;
                }
            };

            let data: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Unreadable tides response for station {}: {}", station, err);
                    last_error = Some(Error::permanent_upstream(SOURCE, err));
                    continue;
                }
            };
            // CO-OPS reports bad requests as 200 with an error object.
            if let Some(message) = data.pointer("/error/message").and_then(|m| m.as_str()) {
                warn!("NOAA rejected station {}: {}", station, message);
                last_error = Some(Error::permanent_upstream(SOURCE, message));
                continue;
            }

            payloads.push(StationPayload {
                station_id: station.clone(),
                data,
            });
        }

        if payloads.is_empty() {
            return Err(last_error.unwrap_or_else(|| Error::permanent_upstream(SOURCE, "no station data")));
        }
        serde_json::to_vec(&payloads).map_err(|e| Error::Internal(e.to_string()))
    }

    fn normalize(&self, raw: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Record>> {
        let payloads: Vec<StationPayload> =
            serde_json::from_slice(raw).map_err(|e| Error::permanent_upstream(SOURCE, e))?;

        let mut records = Vec::new();
        for payload in payloads {
            let Some(rows) = payload.data.get("data").and_then(|d| d.as_array()) else {
                continue;
            };
            for row in rows {
                match parse_row(row) {
                    Some((time, level)) => records.push(Record::new(
                        format!("{}|{}", payload.station_id, time.format("%Y-%m-%dT%H:%MZ")),
                        time,
                        json!({
                            "station_id": payload.station_id,
                            "time": time.to_rfc3339_opts(SecondsFormat::Secs, true),
                            "water_level_m": level,
                        }),
                        fetched_at,
                    )),
                    None => warn!("Skipping invalid tides row for station {}: {}", payload.station_id, row),
                }
            }
        }
        Ok(records)
    }
}

/// `{"t": "2024-01-01 00:06", "v": "1.234", ...}`; `v` is empty when the
/// gauge had no reading.
fn parse_row(row: &serde_json::Value) -> Option<(DateTime<Utc>, f64)> {
    let t = row.get("t")?.as_str()?;
    let time = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M").ok()?.and_utc();
    let level = match row.get("v")? {
        serde_json::Value::String(v) => v.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(v) => v.as_f64()?,
        _ => return None,
    };
    level.is_finite().then_some((time, level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers per station id; unknown stations get a 404.
    struct StationClient {
        responses: Mutex<HashMap<String, Result<Vec<u8>>>>,
        requests: Mutex<Vec<FetchRequest>>,
    }

    impl StationClient {
        fn new(responses: Vec<(&str, Result<serde_json::Value>)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(s, r)| (s.to_string(), r.map(|v| serde_json::to_vec(&v).unwrap())))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceClient for StationClient {
        async fn fetch(&self, request: &FetchRequest, _timeout: Duration) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(request.clone());
            let station = request
                .query
                .iter()
                .find(|(k, _)| k == "station")
                .map(|(_, v)| v.clone())
                .unwrap();
            self.responses
                .lock()
                .unwrap()
                .remove(&station)
                .unwrap_or_else(|| Err(Error::permanent_upstream(SOURCE, "HTTP 404 Not Found")))
        }
    }

    fn window() -> Window {
        let end = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        Window::trailing(end, chrono::Duration::days(7)).unwrap()
    }

    fn station_data(rows: serde_json::Value) -> serde_json::Value {
        json!({ "metadata": { "id": "8454000", "name": "Providence" }, "data": rows })
    }

    fn ingester(client: StationClient, stations: &[&str]) -> TidesIngester {
        TidesIngester::new(
            Arc::new(client),
            DEFAULT_BASE_URL.to_string(),
            stations.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_fetch_skips_rejected_station() {
        let client = StationClient::new(vec![
            ("8454000", Ok(station_data(json!([{"t": "2024-01-01 00:00", "v": "1.25"}])))),
            ("8518750", Ok(json!({"error": {"message": "No data was found."}}))),
        ]);
        let ingester = ingester(client, &["8454000", "8518750", "8574680"]);

        let raw = ingester.fetch(&window(), Duration::from_secs(5)).await.unwrap();
        let records = ingester.normalize(&raw, Utc::now()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].natural_key, "8454000|2024-01-01T00:00Z");
        assert_eq!(records[0].fields["water_level_m"], json!(1.25));
    }

    #[tokio::test]
    async fn test_fetch_propagates_transient_failure() {
        let client = StationClient::new(vec![
            ("8454000", Ok(station_data(json!([])))),
            ("8518750", Err(Error::transient_upstream(SOURCE, "HTTP 503"))),
        ]);
        let ingester = ingester(client, &["8454000", "8518750"]);

        let err = ingester.fetch(&window(), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_all_stations_rejected_is_permanent() {
        let ingester = ingester(StationClient::new(vec![]), &["1", "2"]);
        let err = ingester.fetch(&window(), Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_request_parameters() {
        let client = Arc::new(StationClient::new(vec![("8454000", Ok(station_data(json!([]))))]));
        let ingester = TidesIngester::new(
            Arc::clone(&client) as Arc<dyn SourceClient>,
            DEFAULT_BASE_URL.to_string(),
            vec!["8454000".to_string()],
        );
        ingester.fetch(&window(), Duration::from_secs(5)).await.unwrap();

        let requests = client.requests.lock().unwrap();
        let params: HashMap<_, _> = requests[0].query.iter().cloned().collect();
        assert_eq!(params["begin_date"], "20240101 00:00");
        assert_eq!(params["end_date"], "20240108 00:00");
        assert_eq!(params["product"], "water_level");
        assert_eq!(params["datum"], "MLLW");
    }

    #[test]
    fn test_normalize_skips_invalid_rows() {
        let raw = serde_json::to_vec(&json!([{
            "station_id": "8454000",
            "data": {"data": [
                {"t": "2024-01-01 00:00", "v": "1.0"},
                {"t": "2024-01-01 00:06", "v": ""},
                {"t": "garbage", "v": "1.1"},
                {"v": "1.2"},
                {"t": "2024-01-01 00:12", "v": "1.3"},
            ]}
        }]))
        .unwrap();

        let ingester = ingester(StationClient::new(vec![]), &["8454000"]);
        let records = ingester.normalize(&raw, Utc::now()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].observed_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 12, 0).unwrap()
        );
    }

    #[test]
    fn test_normalize_rejects_malformed_envelope() {
        let ingester = ingester(StationClient::new(vec![]), &["8454000"]);
        let err = ingester.normalize(b"{\"not\": \"a list\"}", Utc::now()).unwrap_err();
        assert!(matches!(err, Error::PermanentUpstream { .. }));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let raw = serde_json::to_vec(&json!([{
            "station_id": "8518750",
            "data": {"data": [{"t": "2024-01-01 00:00", "v": "0.5"}]}
        }]))
        .unwrap();
        let ingester = ingester(StationClient::new(vec![]), &["8518750"]);
        let fetched = Utc::now();
        assert_eq!(
            ingester.normalize(&raw, fetched).unwrap(),
            ingester.normalize(&raw, fetched).unwrap()
        );
    }
}

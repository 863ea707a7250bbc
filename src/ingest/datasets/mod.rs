//! Concrete [`Ingester`] implementations, one per [`DatasetType`].

pub mod erddap;
pub mod tides;
pub mod turbidity;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::IngestConfig;
use crate::ingest::{DatasetType, Ingester, SourceClient};

pub use erddap::ErddapGridIngester;
pub use tides::TidesIngester;
pub use turbidity::TurbidityDemoIngester;

/// Geographic area gridded datasets are pulled for, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Default for BoundingBox {
    /// Chesapeake Bay and the adjacent shelf.
    fn default() -> Self {
        Self {
            lat_min: 36.0,
            lat_max: 40.0,
            lon_min: -77.0,
            lon_max: -74.0,
        }
    }
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&lat) && (self.lon_min..=self.lon_max).contains(&lon)
    }
}

/// Builds the ingester for every enabled dataset type.
pub fn build_registry(config: &IngestConfig, client: Arc<dyn SourceClient>) -> Vec<Arc<dyn Ingester>> {
    config
        .enabled
        .iter()
        .map(|dataset| build(*dataset, config, Arc::clone(&client)))
        .collect()
}

pub fn build(dataset: DatasetType, config: &IngestConfig, client: Arc<dyn SourceClient>) -> Arc<dyn Ingester> {
    match dataset {
        DatasetType::Tides => Arc::new(TidesIngester::new(
            client,
            config.noaa_base_url.clone(),
            config.tide_stations.clone(),
        )),
        DatasetType::Sst => Arc::new(ErddapGridIngester::sst(
            client,
            config.erddap_base_url.clone(),
            config.sst_dataset_id.clone(),
            config.bbox,
        )),
        DatasetType::Currents => Arc::new(ErddapGridIngester::currents(
            client,
            config.erddap_base_url.clone(),
            config.currents_dataset_id.clone(),
            config.bbox,
        )),
        DatasetType::Turbidity => Arc::new(TurbidityDemoIngester::new(config.bbox)),
    }
}

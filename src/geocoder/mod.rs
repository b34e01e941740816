use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::GeocoderConfig;

/// Turns a coordinate into a place name. Implementations never fail, they degrade.
pub trait ReverseGeocoder: Send + Sync {
    fn resolve(&self, lat: f64, lon: f64) -> String;
}

pub fn coordinate_label(lat: f64, lon: f64) -> String {
    format!("{lat:.4}, {lon:.4}")
}

/// Spaces calls to an external service by at least `min_interval`, one caller at a time.
///
/// Shared by every geocoder in the process so worker threads and backfills
/// draw from the same budget.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn run<T>(&self, call: impl FnOnce() -> T) -> T {
        let mut last_call = self.last_call.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        let result = call();
        *last_call = Some(Instant::now());
        result
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NominatimAddress {
    pub road: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NominatimResponse {
    #[serde(default)]
    pub address: NominatimAddress,
    #[serde(default)]
    pub display_name: String,
}

/// `road, city|town|village, state`, or the service's display name when none are present.
pub fn format_place_name(response: &NominatimResponse) -> String {
    let address = &response.address;
    let locality = address
        .city
        .as_ref()
        .or(address.town.as_ref())
        .or(address.village.as_ref());

    let parts: Vec<&str> = [address.road.as_ref(), locality, address.state.as_ref()]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        response.display_name.clone()
    } else {
        parts.join(", ")
    }
}

pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
    limiter: Arc<RateLimiter>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let timeout = Duration::try_from_secs_f64(config.timeout_secs)
            .context("Geocoder: Invalid timeout_secs")?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()
            .context("Geocoder: Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            limiter,
        })
    }

    fn lookup(&self, lat: f64, lon: f64) -> Result<String> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .with_context(|| format!("Geocoder: Request to {} failed", self.endpoint))?;

        if response.status() != StatusCode::OK {
            bail!("Geocoder: Unexpected status {}", response.status());
        }

        let body: NominatimResponse = response
            .json()
            .context("Geocoder: Malformed response body")?;
        Ok(format_place_name(&body))
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    fn resolve(&self, lat: f64, lon: f64) -> String {
        match self.limiter.run(|| self.lookup(lat, lon)) {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => {
                tracing::warn!("Geocoder returned no name for {lat}, {lon}");
                coordinate_label(lat, lon)
            }
            Err(err) => {
                tracing::warn!("Geocoding error: {:#}", err);
                coordinate_label(lat, lon)
            }
        }
    }
}

//! External enrichment providers behind traits: geocoding, valuation, and
//! neighborhood lookups. Every provider is best-effort; the engine treats any
//! error as "data unavailable" and falls back.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use taxsale_core::NeighborhoodSignal;
use taxsale_storage::{FetchError, HttpFetcher};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider response: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: Option<String>,
}

/// One valuation lookup. Coordinates ride along when the valuation source
/// knows them; they take precedence over geocoding.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Valuation {
    pub estimated_value: Option<f64>,
    pub rent_estimate: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub price_history: Option<JsonValue>,
    pub tax_history: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodData {
    pub raw: JsonValue,
    pub signal: NeighborhoodSignal,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>, EnrichError>;
}

#[async_trait]
pub trait ValuationProvider: Send + Sync {
    async fn valuation(&self, address: &str) -> Result<Option<Valuation>, EnrichError>;
}

#[async_trait]
pub trait PlacesProvider: Send + Sync {
    async fn neighborhood(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<NeighborhoodData>, EnrichError>;
}

fn url_with_params(base: &str, params: &[(&str, &str)]) -> Result<String, EnrichError> {
    let url = reqwest::Url::parse_with_params(base, params)
        .map_err(|e| EnrichError::Provider(format!("bad provider URL {base}: {e}")))?;
    Ok(url.into())
}

/// Google-style geocoding endpoint: `status: "OK"` plus a results array with
/// `geometry.location` and `formatted_address`.
pub struct HttpGeocoder {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl HttpGeocoder {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: &str, api_key: &str) -> Self {
        Self {
            fetcher,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>, EnrichError> {
        let url = url_with_params(
            &self.base_url,
            &[("address", address), ("key", &self.api_key)],
        )?;
        let body: JsonValue = self.fetcher.get_json("geocoder", &url).await?;
        Ok(parse_geocode_response(&body))
    }
}

pub fn parse_geocode_response(body: &JsonValue) -> Option<GeocodeResult> {
    if body.get("status").and_then(JsonValue::as_str) != Some("OK") {
        return None;
    }
    let first = body.get("results")?.as_array()?.first()?;
    let location = first.get("geometry")?.get("location")?;
    Some(GeocodeResult {
        latitude: location.get("lat")?.as_f64()?,
        longitude: location.get("lng")?.as_f64()?,
        formatted_address: first
            .get("formatted_address")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string),
    })
}

/// Key-in-query valuation API returning camelCase property estimates.
pub struct HttpValuationProvider {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl HttpValuationProvider {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: &str, api_key: &str) -> Self {
        Self {
            fetcher,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ValuationProvider for HttpValuationProvider {
    async fn valuation(&self, address: &str) -> Result<Option<Valuation>, EnrichError> {
        let url = url_with_params(
            &self.base_url,
            &[("address", address), ("apiKey", &self.api_key)],
        )?;
        let body: JsonValue = self.fetcher.get_json("valuation", &url).await?;
        Ok(parse_valuation_response(&body))
    }
}

pub fn parse_valuation_response(body: &JsonValue) -> Option<Valuation> {
    // Some deployments wrap the record in a one-element array.
    let record = match body {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let valuation = Valuation {
        estimated_value: record.get("estimatedValue").and_then(JsonValue::as_f64),
        rent_estimate: record.get("rentEstimate").and_then(JsonValue::as_f64),
        latitude: record.get("latitude").and_then(JsonValue::as_f64),
        longitude: record.get("longitude").and_then(JsonValue::as_f64),
        price_history: record.get("priceHistory").cloned(),
        tax_history: record.get("taxHistory").cloned(),
    };
    if valuation == Valuation::default() {
        None
    } else {
        Some(valuation)
    }
}

/// Nearby-places endpoint used for neighborhood signals; currently only the
/// school results feed the score.
pub struct HttpPlacesProvider {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl HttpPlacesProvider {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: &str, api_key: &str) -> Self {
        Self {
            fetcher,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl PlacesProvider for HttpPlacesProvider {
    async fn neighborhood(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<NeighborhoodData>, EnrichError> {
        let location = format!("{latitude},{longitude}");
        let url = url_with_params(
            &self.base_url,
            &[
                ("location", location.as_str()),
                ("radius", "1600"),
                ("type", "school"),
                ("key", &self.api_key),
            ],
        )?;
        let body: JsonValue = self.fetcher.get_json("places", &url).await?;
        if body.get("status").and_then(JsonValue::as_str) != Some("OK") {
            return Ok(None);
        }
        let schools: Vec<JsonValue> = body
            .get("results")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .take(3)
                    .map(|place| {
                        json!({
                            "name": place.get("name"),
                            "rating": place.get("rating"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let raw = json!({ "schools": schools });
        let signal = signal_from_json(&raw);
        Ok(Some(NeighborhoodData { raw, signal }))
    }
}

/// Distill whatever neighborhood JSON a provider returned into the two
/// inputs the investment score uses. Absent data never counts in favor.
pub fn signal_from_json(raw: &JsonValue) -> NeighborhoodSignal {
    let demographics = raw.get("demographics");
    let low_crime = demographics
        .and_then(|d| d.get("crime_rate"))
        .and_then(JsonValue::as_str)
        .is_some_and(|r| r.eq_ignore_ascii_case("low"));

    let school_rating = demographics
        .and_then(|d| d.get("school_rating"))
        .and_then(JsonValue::as_f64)
        .or_else(|| average_school_rating(raw));

    NeighborhoodSignal {
        low_crime,
        school_rating,
    }
}

fn average_school_rating(raw: &JsonValue) -> Option<f64> {
    let ratings: Vec<f64> = raw
        .get("schools")?
        .as_array()?
        .iter()
        .filter_map(|s| s.get("rating").and_then(JsonValue::as_f64))
        .collect();
    if ratings.is_empty() {
        return None;
    }
    Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
}

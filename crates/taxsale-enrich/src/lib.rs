//! Enrichment fusion engine: resolves coordinates, pulls valuation and
//! neighborhood data through provider traits, computes investment metrics and
//! a data-quality score. A property enrichment never fails outright; missing
//! or erroring providers degrade to fallbacks and an error marker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::warn;

use taxsale_core::{
    cap_rate, cash_on_cash_return, data_quality_score, gross_rent_multiplier, investment_score,
    potential_profit, roi_percentage, NeighborhoodSignal, Property, PropertyEnrichment,
    QualityChecklist, DEFAULT_REHAB_COST,
};

pub mod providers;

pub use providers::{
    EnrichError, GeocodeResult, Geocoder, HttpGeocoder, HttpPlacesProvider, HttpValuationProvider,
    NeighborhoodData, PlacesProvider, Valuation, ValuationProvider,
};

pub const CRATE_NAME: &str = "taxsale-enrich";

/// Provider responses are reused for a day per full address.
pub const CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Address-keyed cache with per-entry expiry. Concurrent populations race
/// benignly; the last write wins.
pub struct TtlCache<T> {
    ttl: Duration,
    inner: StdMutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: StdMutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.get(key) {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: T) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.insert(key.to_string(), (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deterministic estimate derived from the assessed value, used when no
/// valuation provider responds: 1.2x assessed as market value, 0.8% of
/// assessed as monthly rent. Carries no coordinates or history.
pub fn local_fallback_valuation(assessed_value: f64) -> Valuation {
    Valuation {
        estimated_value: Some(assessed_value * 1.2),
        rent_estimate: Some(assessed_value * 0.008),
        ..Valuation::default()
    }
}

pub struct EnrichmentEngine {
    geocoder: Option<Arc<dyn Geocoder>>,
    valuation: Option<Arc<dyn ValuationProvider>>,
    places: Option<Arc<dyn PlacesProvider>>,
    geocode_cache: TtlCache<GeocodeResult>,
    valuation_cache: TtlCache<Valuation>,
    rehab_cost: f64,
}

impl Default for EnrichmentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrichmentEngine {
    pub fn new() -> Self {
        Self {
            geocoder: None,
            valuation: None,
            places: None,
            geocode_cache: TtlCache::new(CACHE_TTL),
            valuation_cache: TtlCache::new(CACHE_TTL),
            rehab_cost: DEFAULT_REHAB_COST,
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_valuation(mut self, valuation: Arc<dyn ValuationProvider>) -> Self {
        self.valuation = Some(valuation);
        self
    }

    pub fn with_places(mut self, places: Arc<dyn PlacesProvider>) -> Self {
        self.places = Some(places);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.geocode_cache = TtlCache::new(ttl);
        self.valuation_cache = TtlCache::new(ttl);
        self
    }

    /// Enrich one property. Infallible by contract: provider failures are
    /// folded into the row's error marker and fallbacks fill the gaps.
    pub async fn enrich(&self, property: &Property, minimum_bid: f64) -> PropertyEnrichment {
        let address = property.full_address();
        let mut sources = vec!["county-records".to_string()];
        let mut error: Option<String> = None;

        let mut valuation: Option<Valuation> = None;
        if let Some(provider) = &self.valuation {
            valuation = self.valuation_cache.get(&address);
            if valuation.is_none() {
                match provider.valuation(&address).await {
                    Ok(Some(v)) => {
                        self.valuation_cache.insert(&address, v.clone());
                        valuation = Some(v);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(parcel = %property.parcel_number, error = %err, "valuation lookup failed");
                        error.get_or_insert(format!("valuation: {err}"));
                    }
                }
            }
        }
        if valuation.is_some() {
            sources.push("valuation-api".to_string());
        } else if let Some(assessed) = property.assessed_value {
            valuation = Some(local_fallback_valuation(assessed));
            sources.push("local-estimate".to_string());
        }

        // Valuation-embedded coordinates win over the property's own; the
        // geocoder only runs when neither is available.
        let mut coordinates = valuation
            .as_ref()
            .and_then(|v| v.latitude.zip(v.longitude))
            .or_else(|| property.latitude.zip(property.longitude));
        let mut formatted_address = None;
        if coordinates.is_none() {
            if let Some(geocoder) = &self.geocoder {
                let mut geocoded = self.geocode_cache.get(&address);
                if geocoded.is_none() {
                    match geocoder.geocode(&address).await {
                        Ok(Some(result)) => {
                            self.geocode_cache.insert(&address, result.clone());
                            geocoded = Some(result);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(parcel = %property.parcel_number, error = %err, "geocoding failed");
                            error.get_or_insert(format!("geocoder: {err}"));
                        }
                    }
                }
                if let Some(result) = geocoded {
                    coordinates = Some((result.latitude, result.longitude));
                    formatted_address = result.formatted_address;
                    sources.push("geocoder".to_string());
                }
            }
        }

        let mut neighborhood_raw = None;
        let mut signal: Option<NeighborhoodSignal> = None;
        if let (Some((lat, lng)), Some(places)) = (coordinates, &self.places) {
            match places.neighborhood(lat, lng).await {
                Ok(Some(data)) => {
                    neighborhood_raw = Some(data.raw);
                    signal = Some(data.signal);
                    sources.push("places".to_string());
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(parcel = %property.parcel_number, error = %err, "neighborhood lookup failed");
                    error.get_or_insert(format!("places: {err}"));
                }
            }
        }

        let estimated_value = valuation.as_ref().and_then(|v| v.estimated_value);
        let monthly_rent = valuation.as_ref().and_then(|v| v.rent_estimate);
        let annual_rent = monthly_rent.map(|r| r * 12.0);

        let roi = estimated_value.map(|ev| roi_percentage(ev, minimum_bid));
        let cap = match (estimated_value, annual_rent) {
            (Some(ev), Some(rent)) => Some(cap_rate(rent, ev)),
            _ => None,
        };
        let coc = annual_rent.map(|rent| cash_on_cash_return(rent, minimum_bid, self.rehab_cost));
        let grm = match (estimated_value, annual_rent) {
            (Some(ev), Some(rent)) => Some(gross_rent_multiplier(ev, rent)),
            _ => None,
        };
        let profit =
            estimated_value.map(|ev| potential_profit(ev, minimum_bid, self.rehab_cost));
        let score = investment_score(roi.unwrap_or(0.0), signal.as_ref(), property.year_built);

        let checklist = QualityChecklist {
            has_address: is_real_text(&property.address),
            has_owner: is_real_text(&property.owner_name),
            has_coordinates: coordinates.is_some(),
            has_assessed_value: property.assessed_value.is_some(),
            has_year_built: property.year_built.is_some(),
            has_square_footage: property.square_footage.is_some(),
            has_lot_size: property.lot_size.is_some(),
            has_valuation: valuation.is_some(),
            has_neighborhood: neighborhood_raw.is_some(),
        };

        PropertyEnrichment {
            property_id: property.id,
            estimated_value,
            rent_estimate: monthly_rent,
            formatted_address,
            price_history: valuation.as_ref().and_then(|v| v.price_history.clone()),
            tax_history: valuation.as_ref().and_then(|v| v.tax_history.clone()),
            neighborhood: neighborhood_raw,
            roi_percentage: roi,
            cap_rate: cap,
            cash_on_cash_return: coc,
            gross_rent_multiplier: grm,
            potential_profit: profit,
            estimated_rehab_cost: self.rehab_cost,
            investment_score: score,
            data_quality_score: data_quality_score(&checklist),
            sources,
            error,
            last_enriched_at: Utc::now(),
        }
    }

    /// Enrich a batch with bounded parallelism. Every input yields exactly
    /// one output row; per-property failures surface as error-marked rows.
    pub async fn enrich_batch(
        &self,
        targets: &[(Property, f64)],
        max_workers: usize,
    ) -> Vec<PropertyEnrichment> {
        let mut futures = Vec::with_capacity(targets.len());
        for (property, minimum_bid) in targets {
            futures.push(self.enrich(property, *minimum_bid));
        }
        stream::iter(futures)
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await
    }
}

fn is_real_text(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct StubValuation {
        calls: AtomicUsize,
        result: Option<Valuation>,
        fail: bool,
    }

    impl StubValuation {
        fn returning(result: Valuation) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Some(result),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: None,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ValuationProvider for StubValuation {
        async fn valuation(&self, _address: &str) -> Result<Option<Valuation>, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EnrichError::Provider("deadline exceeded".to_string()));
            }
            Ok(self.result.clone())
        }
    }

    struct StubGeocoder;

    #[async_trait]
    impl Geocoder for StubGeocoder {
        async fn geocode(&self, _address: &str) -> Result<Option<GeocodeResult>, EnrichError> {
            Ok(Some(GeocodeResult {
                latitude: 33.19,
                longitude: -96.61,
                formatted_address: Some("100 Main St, McKinney, TX 75069, USA".to_string()),
            }))
        }
    }

    struct StubPlaces;

    #[async_trait]
    impl PlacesProvider for StubPlaces {
        async fn neighborhood(
            &self,
            _latitude: f64,
            _longitude: f64,
        ) -> Result<Option<NeighborhoodData>, EnrichError> {
            let raw = json!({"demographics": {"crime_rate": "Low", "school_rating": 8.0}});
            let signal = providers::signal_from_json(&raw);
            Ok(Some(NeighborhoodData { raw, signal }))
        }
    }

    fn property() -> Property {
        Property {
            id: Uuid::new_v4(),
            parcel_number: "42-0001".into(),
            county: "collin".into(),
            owner_name: "Jane Doe".into(),
            address: "100 Main St".into(),
            city: Some("McKinney".into()),
            state: "TX".into(),
            zip_code: Some("75069".into()),
            legal_description: None,
            property_type: Some("residential".into()),
            assessed_value: Some(200_000.0),
            market_value: None,
            bedrooms: None,
            bathrooms: None,
            square_footage: Some(1800),
            lot_size: Some(7000.0),
            year_built: Some(2015),
            homestead_exemption: false,
            agricultural_exemption: false,
            senior_exemption: false,
            mineral_rights: false,
            latitude: None,
            longitude: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn full_valuation() -> Valuation {
        Valuation {
            estimated_value: Some(300_000.0),
            rent_estimate: Some(2_000.0),
            latitude: Some(33.19),
            longitude: Some(-96.61),
            price_history: Some(json!([{"date": "2020-06-15", "price": 180000.0}])),
            tax_history: None,
        }
    }

    #[tokio::test]
    async fn full_pipeline_computes_metrics_and_score() {
        let engine = EnrichmentEngine::new()
            .with_valuation(Arc::new(StubValuation::returning(full_valuation())))
            .with_places(Arc::new(StubPlaces));

        let enrichment = engine.enrich(&property(), 100_000.0).await;

        assert_eq!(enrichment.estimated_value, Some(300_000.0));
        assert!((enrichment.roi_percentage.unwrap() - 200.0).abs() < 1e-9);
        // Annual rent 24k on a 120k total outlay.
        assert!((enrichment.cash_on_cash_return.unwrap() - 20.0).abs() < 1e-9);
        assert!((enrichment.gross_rent_multiplier.unwrap() - 12.5).abs() < 1e-9);
        assert!((enrichment.cap_rate.unwrap() - 7.0).abs() < 1e-9);
        assert_eq!(enrichment.potential_profit, Some(180_000.0));
        // 50 base + 30 roi + 20 neighborhood + 20 age, clamped.
        assert_eq!(enrichment.investment_score, 100.0);
        assert_eq!(enrichment.data_quality_score, 100.0);
        assert!(enrichment.error.is_none());
        assert!(enrichment.sources.contains(&"valuation-api".to_string()));
        assert!(enrichment.sources.contains(&"places".to_string()));
        // Valuation carried coordinates, so no geocoder in play.
        assert!(!enrichment.sources.contains(&"geocoder".to_string()));
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_local_estimate_with_error_marker() {
        let engine =
            EnrichmentEngine::new().with_valuation(Arc::new(StubValuation::failing()));

        let enrichment = engine.enrich(&property(), 100_000.0).await;

        // assessed 200k -> 240k value, 1600/mo rent, deterministically.
        assert_eq!(enrichment.estimated_value, Some(240_000.0));
        assert_eq!(enrichment.rent_estimate, Some(1_600.0));
        assert!(enrichment.error.as_deref().unwrap().starts_with("valuation:"));
        assert!(enrichment.sources.contains(&"local-estimate".to_string()));
        assert!(!enrichment.sources.contains(&"valuation-api".to_string()));
        // Score still computed: 50 + 30 (roi 140%) + 20 (year 2015).
        assert_eq!(enrichment.investment_score, 100.0);
    }

    #[tokio::test]
    async fn geocoder_runs_only_without_known_coordinates() {
        let valuation_without_coords = Valuation {
            latitude: None,
            longitude: None,
            ..full_valuation()
        };
        let engine = EnrichmentEngine::new()
            .with_valuation(Arc::new(StubValuation::returning(valuation_without_coords)))
            .with_geocoder(Arc::new(StubGeocoder));

        let enrichment = engine.enrich(&property(), 100_000.0).await;
        assert!(enrichment.sources.contains(&"geocoder".to_string()));
        assert_eq!(
            enrichment.formatted_address.as_deref(),
            Some("100 Main St, McKinney, TX 75069, USA")
        );
    }

    #[tokio::test]
    async fn valuation_responses_are_cached_per_address() {
        let stub = Arc::new(StubValuation::returning(full_valuation()));
        let engine = EnrichmentEngine::new().with_valuation(stub.clone());

        let prop = property();
        engine.enrich(&prop, 100_000.0).await;
        engine.enrich(&prop, 90_000.0).await;

        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_entries_trigger_a_fresh_lookup() {
        let stub = Arc::new(StubValuation::returning(full_valuation()));
        let engine = EnrichmentEngine::new()
            .with_valuation(stub.clone())
            .with_cache_ttl(Duration::ZERO);

        let prop = property();
        engine.enrich(&prop, 100_000.0).await;
        engine.enrich(&prop, 100_000.0).await;

        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_returns_one_row_per_input() {
        let engine =
            EnrichmentEngine::new().with_valuation(Arc::new(StubValuation::failing()));

        let mut targets = Vec::new();
        for i in 0..3 {
            let mut prop = property();
            prop.parcel_number = format!("42-000{i}");
            prop.address = format!("{i} Main St");
            targets.push((prop, 50_000.0));
        }

        let rows = engine.enrich_batch(&targets, 2).await;
        assert_eq!(rows.len(), 3);
        for (prop, _) in &targets {
            assert!(rows.iter().any(|r| r.property_id == prop.id));
        }
        assert!(rows.iter().all(|r| r.error.is_some()));
    }
}

//! Reconciliation writer: folds normalized adapter output into the store
//! without creating duplicates or degrading previously captured data.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use taxsale_core::{total_judgment, NormalizedSale, Property, PropertyRecord, SaleStatus, TaxSale};
use taxsale_storage::{Store, StoreError};

/// Counters for one `upsert_sale` call; feeds the job's found counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    pub properties_created: usize,
    pub properties_updated: usize,
    pub sales_created: usize,
    pub sales_updated: usize,
}

/// Owner/address values that count as "nothing known yet" and may be
/// replaced by scraped data.
fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown")
}

/// Merge a scraped record into an existing property. Populated fields are
/// never downgraded: detail fields fill in only when missing, owner and
/// address are replaced only over a placeholder, and coordinates are the one
/// exception that always refreshes when the source supplies them.
pub fn merge_property(existing: &Property, record: &PropertyRecord) -> Property {
    let mut merged = existing.clone();

    if let Some(owner) = &record.owner_name {
        if is_placeholder(&merged.owner_name) && !is_placeholder(owner) {
            merged.owner_name = owner.clone();
        }
    }
    if let Some(address) = &record.address {
        if is_placeholder(&merged.address) && !is_placeholder(address) {
            merged.address = address.clone();
        }
    }

    if record.latitude.is_some() {
        merged.latitude = record.latitude;
    }
    if record.longitude.is_some() {
        merged.longitude = record.longitude;
    }

    merged.city = merged.city.or_else(|| record.city.clone());
    merged.zip_code = merged.zip_code.or_else(|| record.zip_code.clone());
    merged.legal_description = merged
        .legal_description
        .or_else(|| record.legal_description.clone());
    merged.property_type = merged.property_type.or_else(|| record.property_type.clone());
    merged.assessed_value = merged.assessed_value.or(record.assessed_value);
    merged.market_value = merged.market_value.or(record.market_value);
    merged.bedrooms = merged.bedrooms.or(record.bedrooms);
    merged.bathrooms = merged.bathrooms.or(record.bathrooms);
    merged.square_footage = merged.square_footage.or(record.square_footage);
    merged.lot_size = merged.lot_size.or(record.lot_size);
    merged.year_built = merged.year_built.or(record.year_built);

    merged
}

fn property_from_record(county: &str, record: &PropertyRecord) -> Property {
    let now = Utc::now();
    Property {
        id: Uuid::new_v4(),
        parcel_number: record.parcel_number.trim().to_string(),
        county: county.to_string(),
        owner_name: record
            .owner_name
            .clone()
            .filter(|o| !is_placeholder(o))
            .unwrap_or_else(|| "Unknown".to_string()),
        address: record
            .address
            .clone()
            .filter(|a| !is_placeholder(a))
            .unwrap_or_else(|| "Unknown".to_string()),
        city: record.city.clone(),
        state: record.state.clone().unwrap_or_else(|| "TX".to_string()),
        zip_code: record.zip_code.clone(),
        legal_description: record.legal_description.clone(),
        property_type: record.property_type.clone(),
        assessed_value: record.assessed_value,
        market_value: record.market_value,
        bedrooms: record.bedrooms,
        bathrooms: record.bathrooms,
        square_footage: record.square_footage,
        lot_size: record.lot_size,
        year_built: record.year_built,
        homestead_exemption: false,
        agricultural_exemption: false,
        senior_exemption: false,
        mineral_rights: false,
        latitude: record.latitude,
        longitude: record.longitude,
        created_at: now,
        updated_at: now,
    }
}

fn tax_sale_from_record(
    property_id: Uuid,
    sale: &NormalizedSale,
    record: &PropertyRecord,
) -> TaxSale {
    let now = Utc::now();
    let taxes_owed = record.taxes_owed.unwrap_or(0.0);
    TaxSale {
        id: Uuid::new_v4(),
        property_id,
        county: sale.county.clone(),
        sale_date: sale.sale_date,
        minimum_bid: record.minimum_bid,
        taxes_owed,
        interest_penalties: record.interest_penalties,
        court_costs: record.court_costs,
        attorney_fees: record.attorney_fees,
        // Always derived from the components, never trusted from a source.
        total_judgment: total_judgment(
            taxes_owed,
            record.interest_penalties,
            record.court_costs,
            record.attorney_fees,
        ),
        status: SaleStatus::Scheduled,
        case_number: record.case_number.clone(),
        constable_precinct: record.constable_precinct.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub struct ReconciliationWriter {
    store: Arc<dyn Store>,
}

impl ReconciliationWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Upsert one normalized sale. Idempotent: replaying identical input
    /// leaves every row unchanged. Insert races lost to a concurrent job are
    /// retried as updates.
    pub async fn upsert_sale(&self, sale: &NormalizedSale) -> Result<UpsertStats, StoreError> {
        let mut stats = UpsertStats::default();

        for record in &sale.properties {
            let property = self.upsert_property(&sale.county, record, &mut stats).await?;
            self.upsert_tax_sale(&property, sale, record, &mut stats)
                .await?;
        }

        info!(
            county = %sale.county,
            sale_date = %sale.sale_date,
            properties_created = stats.properties_created,
            properties_updated = stats.properties_updated,
            sales_created = stats.sales_created,
            sales_updated = stats.sales_updated,
            "reconciled sale"
        );
        Ok(stats)
    }

    async fn upsert_property(
        &self,
        county: &str,
        record: &PropertyRecord,
        stats: &mut UpsertStats,
    ) -> Result<Property, StoreError> {
        // Parcel number is the global natural key; county is not part of the
        // lookup.
        if let Some(existing) = self.store.property_by_parcel(&record.parcel_number).await? {
            return self.merge_into(existing, record, stats).await;
        }

        let fresh = property_from_record(county, record);
        match self.store.insert_property(&fresh).await {
            Ok(()) => {
                stats.properties_created += 1;
                Ok(fresh)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(parcel = %record.parcel_number, "lost property insert race, merging");
                let existing = self
                    .store
                    .property_by_parcel(&record.parcel_number)
                    .await?
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "property {} vanished after conflict",
                            record.parcel_number
                        ))
                    })?;
                self.merge_into(existing, record, stats).await
            }
            Err(err) => Err(err),
        }
    }

    async fn merge_into(
        &self,
        existing: Property,
        record: &PropertyRecord,
        stats: &mut UpsertStats,
    ) -> Result<Property, StoreError> {
        let merged = merge_property(&existing, record);
        if merged != existing {
            self.store.update_property(&merged).await?;
            stats.properties_updated += 1;
        }
        Ok(merged)
    }

    async fn upsert_tax_sale(
        &self,
        property: &Property,
        sale: &NormalizedSale,
        record: &PropertyRecord,
        stats: &mut UpsertStats,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.store.tax_sale_for(property.id, sale.sale_date).await? {
            self.refresh_bid(&existing, record, stats).await?;
            return Ok(());
        }

        let fresh = tax_sale_from_record(property.id, sale, record);
        match self.store.insert_tax_sale(&fresh).await {
            Ok(()) => {
                stats.sales_created += 1;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                debug!(
                    parcel = %record.parcel_number,
                    sale_date = %sale.sale_date,
                    "lost tax-sale insert race, refreshing bid"
                );
                if let Some(existing) =
                    self.store.tax_sale_for(property.id, sale.sale_date).await?
                {
                    self.refresh_bid(&existing, record, stats).await?;
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-scrapes only touch the minimum bid, and only when it actually
    /// changed; everything else on an existing sale row stays put.
    async fn refresh_bid(
        &self,
        existing: &TaxSale,
        record: &PropertyRecord,
        stats: &mut UpsertStats,
    ) -> Result<(), StoreError> {
        if (existing.minimum_bid - record.minimum_bid).abs() > f64::EPSILON {
            self.store
                .update_minimum_bid(existing.id, record.minimum_bid)
                .await?;
            stats.sales_updated += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use taxsale_core::PropertyEnrichment;
    use taxsale_core::{JobStatus, ScrapingJob};
    use taxsale_storage::MemStore;

    fn record(parcel: &str) -> PropertyRecord {
        PropertyRecord {
            parcel_number: parcel.to_string(),
            owner_name: Some("Jane Doe".into()),
            address: Some("100 Main St".into()),
            city: Some("McKinney".into()),
            state: Some("TX".into()),
            zip_code: Some("75069".into()),
            minimum_bid: 12_500.0,
            taxes_owed: Some(3_500.0),
            interest_penalties: 800.0,
            court_costs: 400.0,
            attorney_fees: 300.0,
            ..PropertyRecord::default()
        }
    }

    fn sale(records: Vec<PropertyRecord>) -> NormalizedSale {
        NormalizedSale {
            sale_date: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
            county: "collin".into(),
            platform: None,
            properties: records,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_identical_input() {
        let store = Arc::new(MemStore::new());
        let writer = ReconciliationWriter::new(store.clone());
        let input = sale(vec![record("42-0001"), record("42-0002")]);

        let first = writer.upsert_sale(&input).await.unwrap();
        assert_eq!(first.properties_created, 2);
        assert_eq!(first.sales_created, 2);

        let second = writer.upsert_sale(&input).await.unwrap();
        assert_eq!(second, UpsertStats::default());
        assert_eq!(store.property_count(), 2);
        assert_eq!(store.sale_count(), 2);
    }

    #[tokio::test]
    async fn judgment_is_recomputed_from_components() {
        let store = Arc::new(MemStore::new());
        let writer = ReconciliationWriter::new(store.clone());
        writer.upsert_sale(&sale(vec![record("42-0001")])).await.unwrap();

        let property = store.property_by_parcel("42-0001").await.unwrap().unwrap();
        let sales = store.sales_for_property(property.id).await.unwrap();
        assert_eq!(sales.len(), 1);
        // 3500 + 800 + 400 + 300
        assert_eq!(sales[0].total_judgment, 5_000.0);
    }

    #[tokio::test]
    async fn rescrape_refreshes_only_a_changed_minimum_bid() {
        let store = Arc::new(MemStore::new());
        let writer = ReconciliationWriter::new(store.clone());
        writer.upsert_sale(&sale(vec![record("42-0001")])).await.unwrap();

        let property = store.property_by_parcel("42-0001").await.unwrap().unwrap();
        let before = store.sales_for_property(property.id).await.unwrap()[0].clone();

        let mut changed = record("42-0001");
        changed.minimum_bid = 14_000.0;
        let stats = writer.upsert_sale(&sale(vec![changed])).await.unwrap();
        assert_eq!(stats.sales_created, 0);
        assert_eq!(stats.sales_updated, 1);

        let after = store.sales_for_property(property.id).await.unwrap()[0].clone();
        assert_eq!(after.id, before.id);
        assert_eq!(after.minimum_bid, 14_000.0);
        assert_eq!(after.taxes_owed, before.taxes_owed);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn merge_never_downgrades_but_always_refreshes_coordinates() {
        let store = Arc::new(MemStore::new());
        let writer = ReconciliationWriter::new(store.clone());

        // First pass: sparse source with a placeholder owner.
        let mut sparse = record("42-0001");
        sparse.owner_name = Some("Unknown".into());
        sparse.assessed_value = Some(200_000.0);
        sparse.latitude = Some(33.0);
        sparse.longitude = Some(-96.0);
        writer.upsert_sale(&sale(vec![sparse])).await.unwrap();

        // Second pass: richer source with a real owner and fresh coords.
        let mut richer = record("42-0001");
        richer.owner_name = Some("Acme Holdings".into());
        richer.address = Some("999 Different St".into());
        richer.assessed_value = Some(1.0);
        richer.latitude = Some(33.19);
        richer.longitude = Some(-96.61);
        writer.upsert_sale(&sale(vec![richer])).await.unwrap();

        let property = store.property_by_parcel("42-0001").await.unwrap().unwrap();
        // Placeholder owner was replaced; populated address was not.
        assert_eq!(property.owner_name, "Acme Holdings");
        assert_eq!(property.address, "100 Main St");
        // Populated assessed value kept; coordinates refreshed.
        assert_eq!(property.assessed_value, Some(200_000.0));
        assert_eq!(property.latitude, Some(33.19));
        assert_eq!(property.longitude, Some(-96.61));
    }

    /// Store wrapper that hides the property on the first lookup, forcing
    /// the writer down the insert path into a unique violation.
    struct RacingStore {
        inner: Arc<MemStore>,
        hidden_once: AtomicBool,
    }

    #[async_trait]
    impl Store for RacingStore {
        async fn property_by_parcel(&self, parcel: &str) -> Result<Option<Property>, StoreError> {
            if self.hidden_once.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.property_by_parcel(parcel).await
        }

        async fn insert_property(&self, p: &Property) -> Result<(), StoreError> {
            self.inner.insert_property(p).await
        }
        async fn update_property(&self, p: &Property) -> Result<(), StoreError> {
            self.inner.update_property(p).await
        }
        async fn tax_sale_for(
            &self,
            property_id: Uuid,
            sale_date: NaiveDate,
        ) -> Result<Option<TaxSale>, StoreError> {
            self.inner.tax_sale_for(property_id, sale_date).await
        }
        async fn sales_for_property(&self, property_id: Uuid) -> Result<Vec<TaxSale>, StoreError> {
            self.inner.sales_for_property(property_id).await
        }
        async fn insert_tax_sale(&self, s: &TaxSale) -> Result<(), StoreError> {
            self.inner.insert_tax_sale(s).await
        }
        async fn update_minimum_bid(&self, id: Uuid, bid: f64) -> Result<(), StoreError> {
            self.inner.update_minimum_bid(id, bid).await
        }
        async fn enrichment_for(
            &self,
            property_id: Uuid,
        ) -> Result<Option<PropertyEnrichment>, StoreError> {
            self.inner.enrichment_for(property_id).await
        }
        async fn upsert_enrichment(&self, e: &PropertyEnrichment) -> Result<(), StoreError> {
            self.inner.upsert_enrichment(e).await
        }
        async fn create_job(&self, job: &ScrapingJob) -> Result<(), StoreError> {
            self.inner.create_job(job).await
        }
        async fn job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, StoreError> {
            self.inner.job(job_id).await
        }
        async fn mark_job_running(&self, job_id: Uuid) -> Result<(), StoreError> {
            self.inner.mark_job_running(job_id).await
        }
        async fn record_job_progress(
            &self,
            job_id: Uuid,
            progress: u8,
            message: &str,
            properties_found: i64,
            sales_found: i64,
        ) -> Result<(), StoreError> {
            self.inner
                .record_job_progress(job_id, progress, message, properties_found, sales_found)
                .await
        }
        async fn finish_job(
            &self,
            job_id: Uuid,
            status: JobStatus,
            errors: &[String],
        ) -> Result<(), StoreError> {
            self.inner.finish_job(job_id, status, errors).await
        }
    }

    #[tokio::test]
    async fn lost_insert_race_is_retried_as_update() {
        let mem = Arc::new(MemStore::new());
        let writer = ReconciliationWriter::new(mem.clone());
        let mut existing = record("42-0001");
        existing.owner_name = Some("Unknown".into());
        writer.upsert_sale(&sale(vec![existing])).await.unwrap();

        let racing = Arc::new(RacingStore {
            inner: mem.clone(),
            hidden_once: AtomicBool::new(true),
        });
        let writer = ReconciliationWriter::new(racing);
        let stats = writer.upsert_sale(&sale(vec![record("42-0001")])).await.unwrap();

        assert_eq!(stats.properties_created, 0);
        assert_eq!(stats.properties_updated, 1);
        assert_eq!(mem.property_count(), 1);
        let property = mem.property_by_parcel("42-0001").await.unwrap().unwrap();
        assert_eq!(property.owner_name, "Jane Doe");
    }
}

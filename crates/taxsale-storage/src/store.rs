//! Persistence seam for the pipeline: a `Store` trait with the Postgres
//! implementation used in production and an in-memory implementation used by
//! orchestrator and writer tests.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use taxsale_core::{JobStatus, Property, PropertyEnrichment, SaleStatus, ScrapingJob, TaxSale};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation. Callers treat this as "row already
    /// exists" and fall through to an update, never as a fatal error.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

fn map_insert_err(err: sqlx::Error, what: &str) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(format!("{what}: {}", db_err.message()));
        }
    }
    StoreError::Database(err)
}

/// Everything the pipeline persists goes through this trait. Property and
/// TaxSale mutation is owned by the reconciliation writer, enrichment rows by
/// the enrichment engine, job rows by the orchestrator.
#[async_trait]
pub trait Store: Send + Sync {
    async fn property_by_parcel(&self, parcel: &str) -> Result<Option<Property>, StoreError>;
    async fn insert_property(&self, property: &Property) -> Result<(), StoreError>;
    async fn update_property(&self, property: &Property) -> Result<(), StoreError>;

    async fn tax_sale_for(
        &self,
        property_id: Uuid,
        sale_date: NaiveDate,
    ) -> Result<Option<TaxSale>, StoreError>;
    async fn sales_for_property(&self, property_id: Uuid) -> Result<Vec<TaxSale>, StoreError>;
    async fn insert_tax_sale(&self, sale: &TaxSale) -> Result<(), StoreError>;
    async fn update_minimum_bid(&self, sale_id: Uuid, minimum_bid: f64) -> Result<(), StoreError>;

    async fn enrichment_for(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyEnrichment>, StoreError>;
    async fn upsert_enrichment(&self, enrichment: &PropertyEnrichment) -> Result<(), StoreError>;

    async fn create_job(&self, job: &ScrapingJob) -> Result<(), StoreError>;
    async fn job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, StoreError>;
    async fn mark_job_running(&self, job_id: Uuid) -> Result<(), StoreError>;
    /// Idempotent progress write. Progress never decreases: the store clamps
    /// with the greatest value seen so far, and writes to terminal jobs are
    /// dropped.
    async fn record_job_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        message: &str,
        properties_found: i64,
        sales_found: i64,
    ) -> Result<(), StoreError>;
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        errors: &[String],
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn property_from_row(row: &PgRow) -> Result<Property, sqlx::Error> {
    Ok(Property {
        id: row.try_get("id")?,
        parcel_number: row.try_get("parcel_number")?,
        county: row.try_get("county")?,
        owner_name: row.try_get("owner_name")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zip_code: row.try_get("zip_code")?,
        legal_description: row.try_get("legal_description")?,
        property_type: row.try_get("property_type")?,
        assessed_value: row.try_get("assessed_value")?,
        market_value: row.try_get("market_value")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        square_footage: row.try_get("square_footage")?,
        lot_size: row.try_get("lot_size")?,
        year_built: row.try_get("year_built")?,
        homestead_exemption: row.try_get("homestead_exemption")?,
        agricultural_exemption: row.try_get("agricultural_exemption")?,
        senior_exemption: row.try_get("senior_exemption")?,
        mineral_rights: row.try_get("mineral_rights")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tax_sale_from_row(row: &PgRow) -> Result<TaxSale, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(TaxSale {
        id: row.try_get("id")?,
        property_id: row.try_get("property_id")?,
        county: row.try_get("county")?,
        sale_date: row.try_get("sale_date")?,
        minimum_bid: row.try_get("minimum_bid")?,
        taxes_owed: row.try_get("taxes_owed")?,
        interest_penalties: row.try_get("interest_penalties")?,
        court_costs: row.try_get("court_costs")?,
        attorney_fees: row.try_get("attorney_fees")?,
        total_judgment: row.try_get("total_judgment")?,
        status: SaleStatus::parse(&status).unwrap_or(SaleStatus::Scheduled),
        case_number: row.try_get("case_number")?,
        constable_precinct: row.try_get("constable_precinct")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn enrichment_from_row(row: &PgRow) -> Result<PropertyEnrichment, sqlx::Error> {
    let sources: serde_json::Value = row.try_get("sources")?;
    let sources = serde_json::from_value(sources).unwrap_or_default();
    Ok(PropertyEnrichment {
        property_id: row.try_get("property_id")?,
        estimated_value: row.try_get("estimated_value")?,
        rent_estimate: row.try_get("rent_estimate")?,
        formatted_address: row.try_get("formatted_address")?,
        price_history: row.try_get("price_history")?,
        tax_history: row.try_get("tax_history")?,
        neighborhood: row.try_get("neighborhood")?,
        roi_percentage: row.try_get("roi_percentage")?,
        cap_rate: row.try_get("cap_rate")?,
        cash_on_cash_return: row.try_get("cash_on_cash_return")?,
        gross_rent_multiplier: row.try_get("gross_rent_multiplier")?,
        potential_profit: row.try_get("potential_profit")?,
        estimated_rehab_cost: row.try_get("estimated_rehab_cost")?,
        investment_score: row.try_get("investment_score")?,
        data_quality_score: row.try_get("data_quality_score")?,
        sources,
        error: row.try_get("error")?,
        last_enriched_at: row.try_get("last_enriched_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScrapingJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let progress: i32 = row.try_get("progress")?;
    let errors: serde_json::Value = row.try_get("errors")?;
    Ok(ScrapingJob {
        job_id: row.try_get("job_id")?,
        county: row.try_get("county")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        progress: progress.clamp(0, 100) as u8,
        message: row.try_get("message")?,
        properties_found: row.try_get("properties_found")?,
        sales_found: row.try_get("sales_found")?,
        errors: serde_json::from_value(errors).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn property_by_parcel(&self, parcel: &str) -> Result<Option<Property>, StoreError> {
        let row = sqlx::query("SELECT * FROM properties WHERE parcel_number = $1")
            .bind(parcel)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| property_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn insert_property(&self, p: &Property) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO properties (
                id, parcel_number, county, owner_name, address, city, state, zip_code,
                legal_description, property_type, assessed_value, market_value,
                bedrooms, bathrooms, square_footage, lot_size, year_built,
                homestead_exemption, agricultural_exemption, senior_exemption, mineral_rights,
                latitude, longitude, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25
            )",
        )
        .bind(p.id)
        .bind(&p.parcel_number)
        .bind(&p.county)
        .bind(&p.owner_name)
        .bind(&p.address)
        .bind(&p.city)
        .bind(&p.state)
        .bind(&p.zip_code)
        .bind(&p.legal_description)
        .bind(&p.property_type)
        .bind(p.assessed_value)
        .bind(p.market_value)
        .bind(p.bedrooms)
        .bind(p.bathrooms)
        .bind(p.square_footage)
        .bind(p.lot_size)
        .bind(p.year_built)
        .bind(p.homestead_exemption)
        .bind(p.agricultural_exemption)
        .bind(p.senior_exemption)
        .bind(p.mineral_rights)
        .bind(p.latitude)
        .bind(p.longitude)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "properties.parcel_number"))?;
        Ok(())
    }

    async fn update_property(&self, p: &Property) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE properties SET
                owner_name = $2, address = $3, city = $4, state = $5, zip_code = $6,
                legal_description = $7, property_type = $8, assessed_value = $9,
                market_value = $10, bedrooms = $11, bathrooms = $12, square_footage = $13,
                lot_size = $14, year_built = $15, homestead_exemption = $16,
                agricultural_exemption = $17, senior_exemption = $18, mineral_rights = $19,
                latitude = $20, longitude = $21, updated_at = $22
             WHERE id = $1",
        )
        .bind(p.id)
        .bind(&p.owner_name)
        .bind(&p.address)
        .bind(&p.city)
        .bind(&p.state)
        .bind(&p.zip_code)
        .bind(&p.legal_description)
        .bind(&p.property_type)
        .bind(p.assessed_value)
        .bind(p.market_value)
        .bind(p.bedrooms)
        .bind(p.bathrooms)
        .bind(p.square_footage)
        .bind(p.lot_size)
        .bind(p.year_built)
        .bind(p.homestead_exemption)
        .bind(p.agricultural_exemption)
        .bind(p.senior_exemption)
        .bind(p.mineral_rights)
        .bind(p.latitude)
        .bind(p.longitude)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tax_sale_for(
        &self,
        property_id: Uuid,
        sale_date: NaiveDate,
    ) -> Result<Option<TaxSale>, StoreError> {
        let row = sqlx::query("SELECT * FROM tax_sales WHERE property_id = $1 AND sale_date = $2")
            .bind(property_id)
            .bind(sale_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| tax_sale_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn sales_for_property(&self, property_id: Uuid) -> Result<Vec<TaxSale>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM tax_sales WHERE property_id = $1 ORDER BY sale_date DESC")
                .bind(property_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(tax_sale_from_row)
            .collect::<Result<_, _>>()
            .map_err(Into::into)
    }

    async fn insert_tax_sale(&self, s: &TaxSale) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tax_sales (
                id, property_id, county, sale_date, minimum_bid, taxes_owed,
                interest_penalties, court_costs, attorney_fees, total_judgment,
                status, case_number, constable_precinct, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(s.id)
        .bind(s.property_id)
        .bind(&s.county)
        .bind(s.sale_date)
        .bind(s.minimum_bid)
        .bind(s.taxes_owed)
        .bind(s.interest_penalties)
        .bind(s.court_costs)
        .bind(s.attorney_fees)
        .bind(s.total_judgment)
        .bind(s.status.as_str())
        .bind(&s.case_number)
        .bind(&s.constable_precinct)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "tax_sales (property_id, sale_date)"))?;
        Ok(())
    }

    async fn update_minimum_bid(&self, sale_id: Uuid, minimum_bid: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tax_sales SET minimum_bid = $2, updated_at = $3 WHERE id = $1")
            .bind(sale_id)
            .bind(minimum_bid)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enrichment_for(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyEnrichment>, StoreError> {
        let row = sqlx::query("SELECT * FROM property_enrichments WHERE property_id = $1")
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| enrichment_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn upsert_enrichment(&self, e: &PropertyEnrichment) -> Result<(), StoreError> {
        let sources = serde_json::to_value(&e.sources).unwrap_or_default();
        sqlx::query(
            "INSERT INTO property_enrichments (
                property_id, estimated_value, rent_estimate, formatted_address,
                price_history, tax_history, neighborhood, roi_percentage, cap_rate,
                cash_on_cash_return, gross_rent_multiplier, potential_profit,
                estimated_rehab_cost, investment_score, data_quality_score, sources,
                error, last_enriched_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (property_id) DO UPDATE SET
                estimated_value = EXCLUDED.estimated_value,
                rent_estimate = EXCLUDED.rent_estimate,
                formatted_address = EXCLUDED.formatted_address,
                price_history = EXCLUDED.price_history,
                tax_history = EXCLUDED.tax_history,
                neighborhood = EXCLUDED.neighborhood,
                roi_percentage = EXCLUDED.roi_percentage,
                cap_rate = EXCLUDED.cap_rate,
                cash_on_cash_return = EXCLUDED.cash_on_cash_return,
                gross_rent_multiplier = EXCLUDED.gross_rent_multiplier,
                potential_profit = EXCLUDED.potential_profit,
                estimated_rehab_cost = EXCLUDED.estimated_rehab_cost,
                investment_score = EXCLUDED.investment_score,
                data_quality_score = EXCLUDED.data_quality_score,
                sources = EXCLUDED.sources,
                error = EXCLUDED.error,
                last_enriched_at = EXCLUDED.last_enriched_at",
        )
        .bind(e.property_id)
        .bind(e.estimated_value)
        .bind(e.rent_estimate)
        .bind(&e.formatted_address)
        .bind(&e.price_history)
        .bind(&e.tax_history)
        .bind(&e.neighborhood)
        .bind(e.roi_percentage)
        .bind(e.cap_rate)
        .bind(e.cash_on_cash_return)
        .bind(e.gross_rent_multiplier)
        .bind(e.potential_profit)
        .bind(e.estimated_rehab_cost)
        .bind(e.investment_score)
        .bind(e.data_quality_score)
        .bind(sources)
        .bind(&e.error)
        .bind(e.last_enriched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_job(&self, job: &ScrapingJob) -> Result<(), StoreError> {
        let errors = serde_json::to_value(&job.errors).unwrap_or_default();
        sqlx::query(
            "INSERT INTO scraping_jobs (
                job_id, county, status, progress, message, properties_found,
                sales_found, errors, started_at, completed_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(job.job_id)
        .bind(&job.county)
        .bind(job.status.as_str())
        .bind(i32::from(job.progress))
        .bind(&job.message)
        .bind(job.properties_found)
        .bind(job.sales_found)
        .bind(errors)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_err(e, "scraping_jobs.job_id"))?;
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM scraping_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scraping_jobs SET status = 'running', started_at = $2
             WHERE job_id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        message: &str,
        properties_found: i64,
        sales_found: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scraping_jobs SET
                progress = GREATEST(progress, $2), message = $3,
                properties_found = $4, sales_found = $5
             WHERE job_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .bind(i32::from(progress.min(100)))
        .bind(message)
        .bind(properties_found)
        .bind(sales_found)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        errors: &[String],
    ) -> Result<(), StoreError> {
        let errors = serde_json::to_value(errors).unwrap_or_default();
        sqlx::query(
            "UPDATE scraping_jobs SET status = $2, errors = $3, completed_at = $4
             WHERE job_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(errors)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store mirroring the Postgres constraints: unique parcel number,
/// unique (property_id, sale_date), monotone job progress, immutable terminal
/// jobs. Backs tests and local demos; never a silent production fallback.
#[derive(Default)]
pub struct MemStore {
    inner: StdMutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    properties: HashMap<Uuid, Property>,
    parcel_index: HashMap<String, Uuid>,
    sales: HashMap<Uuid, TaxSale>,
    sale_index: HashMap<(Uuid, NaiveDate), Uuid>,
    enrichments: HashMap<Uuid, PropertyEnrichment>,
    jobs: HashMap<Uuid, ScrapingJob>,
    progress_log: HashMap<Uuid, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property_count(&self) -> usize {
        self.inner.lock().expect("store lock").properties.len()
    }

    pub fn sale_count(&self) -> usize {
        self.inner.lock().expect("store lock").sales.len()
    }

    /// Every progress value persisted for the job, in write order.
    pub fn progress_log(&self, job_id: Uuid) -> Vec<u8> {
        self.inner
            .lock()
            .expect("store lock")
            .progress_log
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn property_by_parcel(&self, parcel: &str) -> Result<Option<Property>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .parcel_index
            .get(parcel)
            .and_then(|id| inner.properties.get(id))
            .cloned())
    }

    async fn insert_property(&self, property: &Property) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.parcel_index.contains_key(&property.parcel_number) {
            return Err(StoreError::Conflict(format!(
                "properties.parcel_number: {}",
                property.parcel_number
            )));
        }
        inner
            .parcel_index
            .insert(property.parcel_number.clone(), property.id);
        inner.properties.insert(property.id, property.clone());
        Ok(())
    }

    async fn update_property(&self, property: &Property) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if !inner.properties.contains_key(&property.id) {
            return Err(StoreError::NotFound(format!("property {}", property.id)));
        }
        let mut updated = property.clone();
        updated.updated_at = Utc::now();
        inner.properties.insert(property.id, updated);
        Ok(())
    }

    async fn tax_sale_for(
        &self,
        property_id: Uuid,
        sale_date: NaiveDate,
    ) -> Result<Option<TaxSale>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .sale_index
            .get(&(property_id, sale_date))
            .and_then(|id| inner.sales.get(id))
            .cloned())
    }

    async fn sales_for_property(&self, property_id: Uuid) -> Result<Vec<TaxSale>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut sales: Vec<TaxSale> = inner
            .sales
            .values()
            .filter(|s| s.property_id == property_id)
            .cloned()
            .collect();
        sales.sort_by(|a, b| b.sale_date.cmp(&a.sale_date));
        Ok(sales)
    }

    async fn insert_tax_sale(&self, sale: &TaxSale) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let key = (sale.property_id, sale.sale_date);
        if inner.sale_index.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "tax_sales (property_id, sale_date): {} / {}",
                sale.property_id, sale.sale_date
            )));
        }
        inner.sale_index.insert(key, sale.id);
        inner.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    async fn update_minimum_bid(&self, sale_id: Uuid, minimum_bid: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let sale = inner
            .sales
            .get_mut(&sale_id)
            .ok_or_else(|| StoreError::NotFound(format!("tax sale {sale_id}")))?;
        sale.minimum_bid = minimum_bid;
        sale.updated_at = Utc::now();
        Ok(())
    }

    async fn enrichment_for(
        &self,
        property_id: Uuid,
    ) -> Result<Option<PropertyEnrichment>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.enrichments.get(&property_id).cloned())
    }

    async fn upsert_enrichment(&self, enrichment: &PropertyEnrichment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .enrichments
            .insert(enrichment.property_id, enrichment.clone());
        Ok(())
    }

    async fn create_job(&self, job: &ScrapingJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if inner.jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!(
                "scraping_jobs.job_id: {}",
                job.job_id
            )));
        }
        inner.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_job_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        message: &str,
        properties_found: i64,
        sales_found: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let Some(job) = inner.jobs.get(&job_id) else {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        let clamped = progress.min(100).max(job.progress);
        let job = inner.jobs.get_mut(&job_id).expect("checked above");
        job.progress = clamped;
        job.message = message.to_string();
        job.properties_found = properties_found;
        job.sales_found = sales_found;
        inner.progress_log.entry(job_id).or_default().push(clamped);
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        errors: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = status;
        job.errors = errors.to_vec();
        job.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn property(parcel: &str) -> Property {
        Property {
            id: Uuid::new_v4(),
            parcel_number: parcel.to_string(),
            county: "collin".into(),
            owner_name: "Owner".into(),
            address: "1 Elm St".into(),
            city: None,
            state: "TX".into(),
            zip_code: None,
            legal_description: None,
            property_type: None,
            assessed_value: None,
            market_value: None,
            bedrooms: None,
            bathrooms: None,
            square_footage: None,
            lot_size: None,
            year_built: None,
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

    #[tokio::test]
    async fn duplicate_parcel_insert_conflicts() {
        let store = MemStore::new();
        store.insert_property(&property("42-000")).await.unwrap();
        let err = store.insert_property(&property("42-000")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.property_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_sale_date_conflicts() {
        let store = MemStore::new();
        let prop = property("42-001");
        store.insert_property(&prop).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let sale = TaxSale {
            id: Uuid::new_v4(),
            property_id: prop.id,
            county: "collin".into(),
            sale_date: date,
            minimum_bid: 5000.0,
            taxes_owed: 5000.0,
            interest_penalties: 0.0,
            court_costs: 0.0,
            attorney_fees: 0.0,
            total_judgment: 5000.0,
            status: SaleStatus::Scheduled,
            case_number: None,
            constable_precinct: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_tax_sale(&sale).await.unwrap();
        let dup = TaxSale {
            id: Uuid::new_v4(),
            ..sale.clone()
        };
        assert!(matches!(
            store.insert_tax_sale(&dup).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let store = MemStore::new();
        let job = ScrapingJob::pending("dallas");
        let id = job.job_id;
        store.create_job(&job).await.unwrap();
        store.mark_job_running(id).await.unwrap();

        store.record_job_progress(id, 40, "halfway-ish", 1, 1).await.unwrap();
        store.record_job_progress(id, 20, "stale write", 1, 1).await.unwrap();
        store.record_job_progress(id, 90, "almost", 2, 1).await.unwrap();

        assert_eq!(store.progress_log(id), vec![40, 40, 90]);
        assert_eq!(store.job(id).await.unwrap().unwrap().progress, 90);
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let store = MemStore::new();
        let job = ScrapingJob::pending("dallas");
        let id = job.job_id;
        store.create_job(&job).await.unwrap();
        store.mark_job_running(id).await.unwrap();
        store
            .finish_job(id, JobStatus::Failed, &["no source available".into()])
            .await
            .unwrap();

        store.record_job_progress(id, 99, "late event", 5, 5).await.unwrap();
        store.finish_job(id, JobStatus::Completed, &[]).await.unwrap();

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors, vec!["no source available".to_string()]);
        assert_ne!(job.progress, 99);
    }
}

//! Core domain model and investment math for the tax-sale pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "taxsale-core";

/// Default rehab estimate used when no property-specific figure exists.
pub const DEFAULT_REHAB_COST: f64 = 20_000.0;

/// Terminal and in-flight states of an orchestrated scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal jobs are immutable; no further progress or status writes land.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Scheduled,
    Sold,
    StruckOff,
    Cancelled,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Scheduled => "scheduled",
            SaleStatus::Sold => "sold",
            SaleStatus::StruckOff => "struck_off",
            SaleStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(SaleStatus::Scheduled),
            "sold" => Some(SaleStatus::Sold),
            "struck_off" => Some(SaleStatus::StruckOff),
            "cancelled" => Some(SaleStatus::Cancelled),
            _ => None,
        }
    }
}

/// One property row as parsed out of a county source, before reconciliation.
/// Adapters fill what their source carries and leave the rest `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyRecord {
    pub parcel_number: String,
    pub owner_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub legal_description: Option<String>,
    pub property_type: Option<String>,
    pub assessed_value: Option<f64>,
    pub market_value: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub square_footage: Option<i32>,
    pub lot_size: Option<f64>,
    pub year_built: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub minimum_bid: f64,
    pub taxes_owed: Option<f64>,
    pub interest_penalties: f64,
    pub court_costs: f64,
    pub attorney_fees: f64,
    pub case_number: Option<String>,
    pub constable_precinct: Option<String>,
}

/// Handoff contract from adapters into reconciliation: one auction date with
/// the property rows listed under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSale {
    pub sale_date: NaiveDate,
    pub county: String,
    pub platform: Option<String>,
    pub properties: Vec<PropertyRecord>,
}

/// Canonical persisted property. Natural key is the parcel number, which is
/// globally unique across counties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub parcel_number: String,
    pub county: String,
    pub owner_name: String,
    pub address: String,
    pub city: Option<String>,
    pub state: String,
    pub zip_code: Option<String>,
    pub legal_description: Option<String>,
    pub property_type: Option<String>,
    pub assessed_value: Option<f64>,
    pub market_value: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub square_footage: Option<i32>,
    pub lot_size: Option<f64>,
    pub year_built: Option<i32>,
    pub homestead_exemption: bool,
    pub agricultural_exemption: bool,
    pub senior_exemption: bool,
    pub mineral_rights: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Property {
    /// Statutory redemption window in months. Homestead, agricultural and
    /// mineral-rights parcels get the long window.
    pub fn redemption_period_months(&self) -> u32 {
        if self.homestead_exemption || self.agricultural_exemption || self.mineral_rights {
            24
        } else {
            6
        }
    }

    /// First-year redemption penalty owed to the purchaser, in percent.
    pub fn expected_penalty_rate(&self) -> f64 {
        25.0
    }

    pub fn full_address(&self) -> String {
        let mut parts = vec![self.address.clone()];
        if let Some(city) = &self.city {
            parts.push(city.clone());
        }
        parts.push(self.state.clone());
        if let Some(zip) = &self.zip_code {
            parts.push(zip.clone());
        }
        parts.retain(|p| !p.trim().is_empty());
        parts.join(", ")
    }
}

/// One auction listing of a property on a specific date.
/// Unique per (property_id, sale_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxSale {
    pub id: Uuid,
    pub property_id: Uuid,
    pub county: String,
    pub sale_date: NaiveDate,
    pub minimum_bid: f64,
    pub taxes_owed: f64,
    pub interest_penalties: f64,
    pub court_costs: f64,
    pub attorney_fees: f64,
    pub total_judgment: f64,
    pub status: SaleStatus,
    pub case_number: Option<String>,
    pub constable_precinct: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Externally-derived estimates and computed investment metrics, one row per
/// property. Written only by the enrichment engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyEnrichment {
    pub property_id: Uuid,
    pub estimated_value: Option<f64>,
    pub rent_estimate: Option<f64>,
    pub formatted_address: Option<String>,
    pub price_history: Option<JsonValue>,
    pub tax_history: Option<JsonValue>,
    pub neighborhood: Option<JsonValue>,
    pub roi_percentage: Option<f64>,
    pub cap_rate: Option<f64>,
    pub cash_on_cash_return: Option<f64>,
    pub gross_rent_multiplier: Option<f64>,
    pub potential_profit: Option<f64>,
    pub estimated_rehab_cost: f64,
    pub investment_score: f64,
    pub data_quality_score: f64,
    pub sources: Vec<String>,
    pub error: Option<String>,
    pub last_enriched_at: DateTime<Utc>,
}

/// Persisted state-machine record for one orchestrated scrape unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub job_id: Uuid,
    pub county: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub properties_found: i64,
    pub sales_found: i64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScrapingJob {
    pub fn pending(county: &str) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            county: county.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            message: String::new(),
            properties_found: 0,
            sales_found: 0,
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Total judgment is always recomputed from its components; a "total" field
/// supplied by a source is never trusted (an adapter-forged figure could
/// understate the bid floor).
pub fn total_judgment(
    taxes_owed: f64,
    interest_penalties: f64,
    court_costs: f64,
    attorney_fees: f64,
) -> f64 {
    taxes_owed + interest_penalties + court_costs + attorney_fees
}

pub fn roi_percentage(estimated_value: f64, minimum_bid: f64) -> f64 {
    if minimum_bid <= 0.0 {
        return 0.0;
    }
    (estimated_value - minimum_bid) / minimum_bid * 100.0
}

pub fn cap_rate(annual_rent: f64, estimated_value: f64) -> f64 {
    if estimated_value <= 0.0 {
        return 0.0;
    }
    (annual_rent - estimated_value * 0.01) / estimated_value * 100.0
}

pub fn cash_on_cash_return(annual_rent: f64, minimum_bid: f64, rehab_cost: f64) -> f64 {
    let invested = minimum_bid + rehab_cost;
    if invested <= 0.0 {
        return 0.0;
    }
    annual_rent / invested * 100.0
}

pub fn gross_rent_multiplier(estimated_value: f64, annual_rent: f64) -> f64 {
    if annual_rent <= 0.0 {
        return 0.0;
    }
    estimated_value / annual_rent
}

pub fn potential_profit(estimated_value: f64, minimum_bid: f64, rehab_cost: f64) -> f64 {
    (estimated_value - minimum_bid - rehab_cost).max(0.0)
}

/// Neighborhood inputs the score cares about, distilled from whatever the
/// places provider returned.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NeighborhoodSignal {
    pub low_crime: bool,
    pub school_rating: Option<f64>,
}

/// Composite 0-100 heuristic ranking an opportunity.
///
/// Base 50; ROI thresholds add up to 30, neighborhood signals up to 20,
/// property age up to 20. Clamped to [0, 100].
pub fn investment_score(
    roi_pct: f64,
    neighborhood: Option<&NeighborhoodSignal>,
    year_built: Option<i32>,
) -> f64 {
    let mut score: f64 = 50.0;

    if roi_pct > 100.0 {
        score += 30.0;
    } else if roi_pct > 50.0 {
        score += 20.0;
    } else if roi_pct > 25.0 {
        score += 10.0;
    }

    if let Some(signal) = neighborhood {
        if signal.low_crime {
            score += 10.0;
        }
        if signal.school_rating.is_some_and(|r| r > 7.0) {
            score += 10.0;
        }
    }

    if let Some(year) = year_built {
        if year > 2000 {
            score += 20.0;
        } else if year > 1980 {
            score += 10.0;
        }
    }

    score.clamp(0.0, 100.0)
}

/// Which of the fields that matter for due diligence are actually populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityChecklist {
    pub has_address: bool,
    pub has_owner: bool,
    pub has_coordinates: bool,
    pub has_assessed_value: bool,
    pub has_year_built: bool,
    pub has_square_footage: bool,
    pub has_lot_size: bool,
    pub has_valuation: bool,
    pub has_neighborhood: bool,
}

/// Fraction of the checklist that is populated, scaled to 0-100. Valuation
/// data is weighted double since most downstream metrics depend on it.
pub fn data_quality_score(checklist: &QualityChecklist) -> f64 {
    let mut filled = 0u32;
    let mut total = 0u32;
    for present in [
        checklist.has_address,
        checklist.has_owner,
        checklist.has_coordinates,
        checklist.has_assessed_value,
        checklist.has_year_built,
        checklist.has_square_footage,
        checklist.has_lot_size,
    ] {
        total += 1;
        if present {
            filled += 1;
        }
    }
    total += 2;
    if checklist.has_valuation {
        filled += 2;
    }
    total += 1;
    if checklist.has_neighborhood {
        filled += 1;
    }
    (f64::from(filled) / f64::from(total) * 100.0).clamp(0.0, 100.0)
}

//! Source adapters: one per kind of county data source, each turning a fetch
//! of that source into normalized sale records. Adapters know nothing about
//! persistence; the orchestrator owns the fallback chain and the writer owns
//! reconciliation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use taxsale_core::{NormalizedSale, PropertyRecord};
use taxsale_storage::{FetchError, FetchedBody, HttpFetcher, SnapshotStore};

pub mod parse;
pub mod registry;

pub use registry::{AdapterSpec, CountyConfig, CountyRegistry};

pub const CRATE_NAME: &str = "taxsale-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What one adapter run produced. Row-level failures are skipped rows, not
/// fatal: they ride along so the job can report them without aborting.
#[derive(Debug, Default)]
pub struct AdapterOutcome {
    pub sales: Vec<NormalizedSale>,
    pub row_errors: Vec<String>,
}

impl AdapterOutcome {
    pub fn property_count(&self) -> usize {
        self.sales.iter().map(|s| s.properties.len()).sum()
    }
}

/// Per-run fetch handle given to adapters: shared HTTP client, optional raw
/// snapshot archive, and a fixed inter-fetch delay so one run never hits a
/// county site back to back.
pub struct SourceClient {
    fetcher: Arc<HttpFetcher>,
    snapshots: Option<Arc<SnapshotStore>>,
    fetch_delay: Duration,
    last_fetch: Mutex<Option<Instant>>,
}

impl SourceClient {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        snapshots: Option<Arc<SnapshotStore>>,
        fetch_delay: Duration,
    ) -> Self {
        Self {
            fetcher,
            snapshots,
            fetch_delay,
            last_fetch: Mutex::new(None),
        }
    }

    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        snapshot_ext: &str,
    ) -> Result<FetchedBody, AdapterError> {
        self.pace().await;
        let fetched = self.fetcher.get(source_id, url).await?;
        if let Some(snapshots) = &self.snapshots {
            if let Err(err) = snapshots
                .store(source_id, Utc::now(), snapshot_ext, &fetched.body)
                .await
            {
                warn!(source_id, url, error = %err, "failed to archive raw snapshot");
            }
        }
        Ok(fetched)
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<T, AdapterError> {
        let fetched = self.get(source_id, url, "json").await?;
        serde_json::from_slice(&fetched.body)
            .map_err(|e| AdapterError::Parse(format!("invalid JSON from {url}: {e}")))
    }

    async fn pace(&self) {
        let mut last = self.last_fetch.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.fetch_delay {
                sleep(self.fetch_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn county(&self) -> &str;

    async fn fetch_and_parse(&self, client: &SourceClient)
        -> Result<AdapterOutcome, AdapterError>;
}

fn sel(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Parse(format!("selector {selector}: {e}")))
}

fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ---------------------------------------------------------------------------
// HTML table
// ---------------------------------------------------------------------------

/// County assessor pages that publish upcoming sales as
/// `div.sale-listing` sections with a property table per sale date.
pub struct HtmlTableAdapter {
    county: String,
    source_id: String,
    url: String,
    state: String,
}

impl HtmlTableAdapter {
    pub fn new(county: &str, source_id: &str, url: &str, state: &str) -> Self {
        Self {
            county: county.to_string(),
            source_id: source_id.to_string(),
            url: url.to_string(),
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlTableAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn county(&self) -> &str {
        &self.county
    }

    async fn fetch_and_parse(
        &self,
        client: &SourceClient,
    ) -> Result<AdapterOutcome, AdapterError> {
        let page = client.get(&self.source_id, &self.url, "html").await?;
        let (sales, row_errors) = parse_sale_listings(&self.county, &self.state, &page.text())?;
        info!(
            source_id = %self.source_id,
            sales = sales.len(),
            skipped = row_errors.len(),
            "parsed sale listings"
        );
        Ok(AdapterOutcome { sales, row_errors })
    }
}

/// Parse `div.sale-listing` sections: a `span.sale-date` header and
/// `tr.property-row` rows of (parcel, owner, address, minimum bid).
pub fn parse_sale_listings(
    county: &str,
    state: &str,
    html_text: &str,
) -> Result<(Vec<NormalizedSale>, Vec<String>), AdapterError> {
    let document = Html::parse_document(html_text);
    let section_sel = sel("div.sale-listing")?;
    let date_sel = sel("span.sale-date")?;
    let row_sel = sel("tr.property-row")?;
    let cell_sel = sel("td")?;

    let mut sales = Vec::new();
    let mut row_errors = Vec::new();

    for section in document.select(&section_sel) {
        let date_text = section
            .select(&date_sel)
            .next()
            .map(|n| n.text().collect::<String>());
        let Some(date_text) = date_text else {
            row_errors.push("sale listing without a sale date".to_string());
            continue;
        };
        let Some(sale_date) = parse::parse_date_multi(&date_text) else {
            row_errors.push(format!("unparseable sale date '{}'", date_text.trim()));
            continue;
        };

        let mut properties = Vec::new();
        for row in section.select(&row_sel) {
            let cells: Vec<String> = row
                .select(&cell_sel)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() < 4 {
                row_errors.push(format!(
                    "property row with {} cells, expected at least 4",
                    cells.len()
                ));
                continue;
            }
            if cells[0].is_empty() {
                row_errors.push("property row without a parcel number".to_string());
                continue;
            }
            let minimum_bid = match parse::parse_currency(&cells[3]) {
                Some(bid) => bid,
                None => {
                    row_errors.push(format!(
                        "unparseable minimum bid '{}' for parcel {}",
                        cells[3], cells[0]
                    ));
                    continue;
                }
            };
            let (street, city, zip) = parse::split_address(&cells[2]);
            properties.push(PropertyRecord {
                parcel_number: cells[0].clone(),
                owner_name: parse::text_or_none(&cells[1]),
                address: parse::text_or_none(&street),
                city,
                state: Some(state.to_string()),
                zip_code: zip,
                minimum_bid,
                ..PropertyRecord::default()
            });
        }

        sales.push(NormalizedSale {
            sale_date,
            county: county.to_string(),
            platform: None,
            properties,
        });
    }

    Ok((sales, row_errors))
}

// ---------------------------------------------------------------------------
// Struck-off PDF list
// ---------------------------------------------------------------------------

/// Counties that publish a downloadable PDF of struck-off parcels. The
/// listing page is scanned for tax-sale PDF links, each PDF is pulled and its
/// text layer parsed line by line.
pub struct StruckOffPdfAdapter {
    county: String,
    source_id: String,
    page_url: String,
    state: String,
}

impl StruckOffPdfAdapter {
    pub fn new(county: &str, source_id: &str, page_url: &str, state: &str) -> Self {
        Self {
            county: county.to_string(),
            source_id: source_id.to_string(),
            page_url: page_url.to_string(),
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for StruckOffPdfAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn county(&self) -> &str {
        &self.county
    }

    async fn fetch_and_parse(
        &self,
        client: &SourceClient,
    ) -> Result<AdapterOutcome, AdapterError> {
        let page = client.get(&self.source_id, &self.page_url, "html").await?;
        let links = find_tax_sale_pdf_links(&page.text())?;
        if links.is_empty() {
            info!(source_id = %self.source_id, "no tax-sale PDF links on listing page");
            return Ok(AdapterOutcome::default());
        }

        let base = reqwest::Url::parse(&page.final_url)
            .map_err(|e| AdapterError::Parse(format!("bad listing page URL: {e}")))?;

        let mut outcome = AdapterOutcome::default();
        for href in links {
            let pdf_url = match base.join(&href) {
                Ok(url) => url,
                Err(err) => {
                    outcome
                        .row_errors
                        .push(format!("unresolvable PDF link '{href}': {err}"));
                    continue;
                }
            };
            let pdf = client.get(&self.source_id, pdf_url.as_str(), "pdf").await?;
            let text = match pdf_extract::extract_text_from_mem(&pdf.body) {
                Ok(text) => text,
                Err(err) => {
                    outcome
                        .row_errors
                        .push(format!("PDF text extraction failed for {pdf_url}: {err}"));
                    continue;
                }
            };
            match parse_struck_off_text(&self.county, &self.state, &text) {
                Ok((sales, mut row_errors)) => {
                    outcome.sales.extend(sales);
                    outcome.row_errors.append(&mut row_errors);
                }
                Err(err) => {
                    outcome.row_errors.push(format!("{pdf_url}: {err}"));
                }
            }
        }
        Ok(outcome)
    }
}

/// Hrefs of PDF links whose anchor text mentions a tax sale or struck-off
/// list.
pub fn find_tax_sale_pdf_links(html_text: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html_text);
    let link_sel = sel("a[href]")?;
    let mut links = Vec::new();
    for anchor in document.select(&link_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.to_ascii_lowercase().ends_with(".pdf") {
            continue;
        }
        let text = anchor.text().collect::<String>().to_ascii_lowercase();
        if text.contains("tax sale") || text.contains("struck") {
            links.push(href.to_string());
        }
    }
    Ok(links)
}

/// Parse the extracted text of a struck-off list. The sale date comes from
/// anywhere in the document header; data rows are `parcel  address  $bid`
/// separated by runs of whitespace.
pub fn parse_struck_off_text(
    county: &str,
    state: &str,
    text: &str,
) -> Result<(Vec<NormalizedSale>, Vec<String>), AdapterError> {
    let Some(sale_date) = find_sale_date(text) else {
        return Err(AdapterError::Parse(
            "no sale date found in struck-off list".to_string(),
        ));
    };

    let row_re = Regex::new(r"^\s*([0-9][0-9A-Za-z.\-]{4,})\s{2,}(.+?)\s{2,}\$?([\d,]+(?:\.\d{2})?)\s*$")
        .map_err(|e| AdapterError::Parse(e.to_string()))?;

    let mut properties = Vec::new();
    let mut row_errors = Vec::new();

    for line in text.lines() {
        if let Some(caps) = row_re.captures(line) {
            let parcel = caps[1].to_string();
            let Some(minimum_bid) = parse::parse_currency(&caps[3]) else {
                row_errors.push(format!("unparseable bid for parcel {parcel}"));
                continue;
            };
            let (street, city, zip) = parse::split_address(&caps[2]);
            properties.push(PropertyRecord {
                parcel_number: parcel,
                owner_name: None,
                address: parse::text_or_none(&street),
                city,
                state: Some(state.to_string()),
                zip_code: zip,
                minimum_bid,
                ..PropertyRecord::default()
            });
        } else if line.contains('$') && line.chars().any(|c| c.is_ascii_digit()) {
            row_errors.push(format!("unparseable struck-off row: {}", truncate(line, 80)));
        }
    }

    let sales = vec![NormalizedSale {
        sale_date,
        county: county.to_string(),
        platform: None,
        properties,
    }];
    Ok((sales, row_errors))
}

fn find_sale_date(text: &str) -> Option<NaiveDate> {
    // Numeric form first, then the written-out month form.
    for pattern in [r"\d{1,2}/\d{1,2}/\d{4}", r"[A-Z][a-z]+ \d{1,2}, \d{4}"] {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        for m in re.find_iter(text) {
            if let Some(date) = parse::parse_date_multi(m.as_str()) {
                return Some(date);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Auction JSON API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuctionListResponse {
    #[serde(default)]
    data: Vec<AuctionSummary>,
}

#[derive(Debug, Deserialize)]
struct AuctionSummary {
    id: String,
    auction_date: String,
}

#[derive(Debug, Deserialize)]
struct AuctionPropertiesResponse {
    #[serde(default)]
    data: Vec<ApiProperty>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiProperty {
    parcel_id: String,
    property_address: String,
    owner_name: String,
    property_type: Option<String>,
    minimum_bid: Option<f64>,
    judgment_amount: Option<f64>,
    case_number: Option<String>,
    legal_description: Option<String>,
}

/// Online auction platforms with a JSON API: one call lists the county's
/// auctions, one call per auction lists its properties.
pub struct AuctionApiAdapter {
    county: String,
    source_id: String,
    api_base: String,
    county_code: String,
    state: String,
}

impl AuctionApiAdapter {
    pub fn new(
        county: &str,
        source_id: &str,
        api_base: &str,
        county_code: &str,
        state: &str,
    ) -> Self {
        Self {
            county: county.to_string(),
            source_id: source_id.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            county_code: county_code.to_string(),
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for AuctionApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn county(&self) -> &str {
        &self.county
    }

    async fn fetch_and_parse(
        &self,
        client: &SourceClient,
    ) -> Result<AdapterOutcome, AdapterError> {
        let list_url = format!("{}/auctions?county={}", self.api_base, self.county_code);
        let auctions: AuctionListResponse = client.get_json(&self.source_id, &list_url).await?;

        let mut outcome = AdapterOutcome::default();
        for auction in auctions.data {
            let Some(sale_date) = parse_auction_date(&auction.auction_date) else {
                outcome.row_errors.push(format!(
                    "auction {} has unparseable date '{}'",
                    auction.id, auction.auction_date
                ));
                continue;
            };

            let props_url = format!("{}/auctions/{}/properties", self.api_base, auction.id);
            let response: AuctionPropertiesResponse =
                client.get_json(&self.source_id, &props_url).await?;

            let mut properties = Vec::new();
            for prop in response.data {
                match normalize_api_property(&self.state, prop) {
                    Ok(record) => properties.push(record),
                    Err(err) => outcome.row_errors.push(err),
                }
            }

            outcome.sales.push(NormalizedSale {
                sale_date,
                county: self.county.clone(),
                platform: Some("realauction".to_string()),
                properties,
            });
        }
        Ok(outcome)
    }
}

fn parse_auction_date(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| parse::parse_date_multi(raw))
}

fn normalize_api_property(state: &str, prop: ApiProperty) -> Result<PropertyRecord, String> {
    if prop.parcel_id.trim().is_empty() {
        return Err("API property without a parcel id".to_string());
    }
    let (street, city, zip) = parse::split_address(&prop.property_address);
    Ok(PropertyRecord {
        parcel_number: prop.parcel_id.trim().to_string(),
        owner_name: parse::text_or_none(&prop.owner_name),
        address: parse::text_or_none(&street),
        city,
        state: Some(state.to_string()),
        zip_code: zip,
        legal_description: prop.legal_description.as_deref().and_then(parse::text_or_none),
        property_type: prop.property_type.as_deref().and_then(parse::text_or_none),
        minimum_bid: prop.minimum_bid.unwrap_or(0.0),
        taxes_owed: prop.judgment_amount,
        case_number: prop.case_number.as_deref().and_then(parse::text_or_none),
        ..PropertyRecord::default()
    })
}

// ---------------------------------------------------------------------------
// Public real-estate page
// ---------------------------------------------------------------------------

/// Public sale-listing pages that render from a JSON blob embedded in the
/// HTML. The blob is pulled out with the known script patterns and its
/// property objects grouped by sale date.
pub struct PublicPageAdapter {
    county: String,
    source_id: String,
    url: String,
    state: String,
}

impl PublicPageAdapter {
    pub fn new(county: &str, source_id: &str, url: &str, state: &str) -> Self {
        Self {
            county: county.to_string(),
            source_id: source_id.to_string(),
            url: url.to_string(),
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for PublicPageAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn county(&self) -> &str {
        &self.county
    }

    async fn fetch_and_parse(
        &self,
        client: &SourceClient,
    ) -> Result<AdapterOutcome, AdapterError> {
        let page = client.get(&self.source_id, &self.url, "html").await?;
        let raw_properties = extract_embedded_properties(&page.text())?;
        if raw_properties.is_empty() {
            info!(source_id = %self.source_id, "no embedded property data on public page");
            return Ok(AdapterOutcome::default());
        }
        let (sales, row_errors) =
            group_public_properties(&self.county, &self.state, &raw_properties);
        Ok(AdapterOutcome { sales, row_errors })
    }
}

/// Find property objects embedded in page scripts. Patterns are tried in
/// order; the first blob that parses as JSON wins.
pub fn extract_embedded_properties(html_text: &str) -> Result<Vec<JsonValue>, AdapterError> {
    let patterns = [
        r"(?s)window\.__INITIAL_STATE__\s*=\s*(\{.*?\});",
        r"(?s)var\s+properties\s*=\s*(\[.*?\]);",
        r#"(?s)"properties"\s*:\s*(\[.*?\])"#,
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).map_err(|e| AdapterError::Parse(e.to_string()))?;
        let Some(caps) = re.captures(html_text) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<JsonValue>(&caps[1]) else {
            continue;
        };
        match value {
            JsonValue::Array(items) => return Ok(items),
            JsonValue::Object(map) => {
                if let Some(JsonValue::Array(items)) = map.get("properties") {
                    return Ok(items.clone());
                }
            }
            _ => {}
        }
    }
    Ok(Vec::new())
}

fn group_public_properties(
    county: &str,
    state: &str,
    raw_properties: &[JsonValue],
) -> (Vec<NormalizedSale>, Vec<String>) {
    use std::collections::BTreeMap;

    let mut by_date: BTreeMap<NaiveDate, Vec<PropertyRecord>> = BTreeMap::new();
    let mut row_errors = Vec::new();

    for raw in raw_properties {
        let Some(date_text) = json_str(raw, "sale_date") else {
            row_errors.push("embedded property without a sale_date".to_string());
            continue;
        };
        let Some(sale_date) = parse::parse_date_multi(date_text) else {
            row_errors.push(format!("unparseable sale_date '{date_text}'"));
            continue;
        };
        match normalize_public_property(state, raw) {
            Ok(record) => by_date.entry(sale_date).or_default().push(record),
            Err(err) => row_errors.push(err),
        }
    }

    let sales = by_date
        .into_iter()
        .map(|(sale_date, properties)| NormalizedSale {
            sale_date,
            county: county.to_string(),
            platform: Some("lgbs".to_string()),
            properties,
        })
        .collect();
    (sales, row_errors)
}

fn normalize_public_property(state: &str, raw: &JsonValue) -> Result<PropertyRecord, String> {
    let parcel = json_str(raw, "parcel_id")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| json_str(raw, "account_number").filter(|s| !s.trim().is_empty()))
        .ok_or_else(|| "embedded property without a parcel id".to_string())?;

    let (street, split_city, split_zip) =
        parse::split_address(json_str(raw, "property_address").unwrap_or_default());

    Ok(PropertyRecord {
        parcel_number: parcel.trim().to_string(),
        owner_name: json_str(raw, "owner_name").and_then(parse::text_or_none),
        address: parse::text_or_none(&street),
        city: json_str(raw, "city")
            .and_then(parse::text_or_none)
            .or(split_city),
        state: json_str(raw, "state")
            .and_then(parse::text_or_none)
            .or_else(|| Some(state.to_string())),
        zip_code: json_str(raw, "zip")
            .and_then(parse::text_or_none)
            .or(split_zip),
        legal_description: json_str(raw, "legal_description").and_then(parse::text_or_none),
        property_type: json_str(raw, "property_type").and_then(parse::text_or_none),
        assessed_value: json_f64(raw, "assessed_value"),
        market_value: json_f64(raw, "adjudged_value").or_else(|| json_f64(raw, "assessed_value")),
        square_footage: json_i32(raw, "building_sqft"),
        lot_size: json_f64(raw, "lot_size"),
        year_built: json_i32(raw, "year_built"),
        latitude: json_f64(raw, "latitude"),
        longitude: json_f64(raw, "longitude"),
        minimum_bid: json_f64(raw, "minimum_bid").unwrap_or(0.0),
        taxes_owed: json_f64(raw, "taxes_owed"),
        case_number: json_str(raw, "case_number").and_then(parse::text_or_none),
        constable_precinct: json_str(raw, "precinct").and_then(parse::text_or_none),
        ..PropertyRecord::default()
    })
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

fn json_f64(value: &JsonValue, key: &str) -> Option<f64> {
    let field = value.get(key)?;
    field
        .as_f64()
        .or_else(|| field.as_str().and_then(parse::parse_currency))
}

fn json_i32(value: &JsonValue, key: &str) -> Option<i32> {
    let field = value.get(key)?;
    field
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))
}

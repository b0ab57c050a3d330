//! County registry: which counties exist and which adapters, in priority
//! order, know how to read their sources. Loaded from `counties.yaml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    AuctionApiAdapter, HtmlTableAdapter, PublicPageAdapter, SourceAdapter, StruckOffPdfAdapter,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CountyRegistry {
    pub counties: Vec<CountyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountyConfig {
    /// Short code used as the job target and in logs, e.g. `collin`.
    pub code: String,
    pub display_name: String,
    pub state: String,
    #[serde(default)]
    pub auction_location: Option<String>,
    /// Priority-ordered: the orchestrator walks this chain front to back.
    pub adapters: Vec<AdapterSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    HtmlTable {
        source_id: String,
        url: String,
    },
    StruckOffPdf {
        source_id: String,
        url: String,
    },
    AuctionApi {
        source_id: String,
        api_base: String,
        county_code: String,
    },
    PublicPage {
        source_id: String,
        url: String,
    },
}

impl AdapterSpec {
    pub fn source_id(&self) -> &str {
        match self {
            AdapterSpec::HtmlTable { source_id, .. }
            | AdapterSpec::StruckOffPdf { source_id, .. }
            | AdapterSpec::AuctionApi { source_id, .. }
            | AdapterSpec::PublicPage { source_id, .. } => source_id,
        }
    }
}

impl CountyRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading county registry {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self =
            serde_yaml::from_str(text).context("parsing county registry YAML")?;
        for county in &registry.counties {
            if county.adapters.is_empty() {
                anyhow::bail!("county {} has no adapters configured", county.code);
            }
        }
        Ok(registry)
    }

    pub fn county(&self, code: &str) -> Option<&CountyConfig> {
        self.counties.iter().find(|c| c.code == code)
    }

    pub fn county_codes(&self) -> Vec<String> {
        self.counties.iter().map(|c| c.code.clone()).collect()
    }
}

impl CountyConfig {
    /// Instantiate the adapter chain in registry priority order.
    pub fn build_chain(&self) -> Vec<Box<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .map(|spec| -> Box<dyn SourceAdapter> {
                match spec {
                    AdapterSpec::HtmlTable { source_id, url } => Box::new(HtmlTableAdapter::new(
                        &self.code,
                        source_id,
                        url,
                        &self.state,
                    )),
                    AdapterSpec::StruckOffPdf { source_id, url } => Box::new(
                        StruckOffPdfAdapter::new(&self.code, source_id, url, &self.state),
                    ),
                    AdapterSpec::AuctionApi {
                        source_id,
                        api_base,
                        county_code,
                    } => Box::new(AuctionApiAdapter::new(
                        &self.code,
                        source_id,
                        api_base,
                        county_code,
                        &self.state,
                    )),
                    AdapterSpec::PublicPage { source_id, url } => Box::new(
                        PublicPageAdapter::new(&self.code, source_id, url, &self.state),
                    ),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
counties:
  - code: collin
    display_name: Collin County
    state: TX
    auction_location: Collin County Courthouse
    adapters:
      - kind: html_table
        source_id: collin-tax-sales
        url: https://county.example/tax_assessor/taxsales.aspx
      - kind: struck_off_pdf
        source_id: collin-struck-off
        url: https://county.example/tax_assessor/struckoff.aspx
  - code: dallas
    display_name: Dallas County
    state: TX
    adapters:
      - kind: auction_api
        source_id: dallas-auction-api
        api_base: https://api.auctions.example/api/v1
        county_code: dallas-tx
      - kind: public_page
        source_id: dallas-public-page
        url: https://taxsales.example/?county=DALLAS%20COUNTY&state=TX
"#;

    #[test]
    fn registry_parses_and_preserves_chain_order() {
        let registry = CountyRegistry::from_yaml(SAMPLE).unwrap();
        assert_eq!(registry.county_codes(), vec!["collin", "dallas"]);

        let collin = registry.county("collin").unwrap();
        assert_eq!(collin.display_name, "Collin County");
        let chain = collin.build_chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].source_id(), "collin-tax-sales");
        assert_eq!(chain[1].source_id(), "collin-struck-off");

        let dallas = registry.county("dallas").unwrap();
        let chain = dallas.build_chain();
        assert_eq!(chain[0].source_id(), "dallas-auction-api");
        assert_eq!(chain[1].source_id(), "dallas-public-page");

        assert!(registry.county("tarrant").is_none());
    }

    #[test]
    fn empty_adapter_chain_is_rejected() {
        let bad = r#"
counties:
  - code: ghost
    display_name: Ghost County
    state: TX
    adapters: []
"#;
        assert!(CountyRegistry::from_yaml(bad).is_err());
    }
}

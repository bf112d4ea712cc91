use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use crate::error::AppError;

const DEFAULT_EXCHANGE: &str = "NSE";

/// `EXCHANGE:TOKEN` form used to compare symbols from different sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedSymbol {
    pub exchange: String,
    pub token: String,
}

impl fmt::Display for NormalizedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.token)
    }
}

/// Upper-case and split `EX:TOKEN`; a bare token gets the default exchange.
pub fn normalize_symbol(raw: &str) -> NormalizedSymbol {
    let s = raw.trim().to_ascii_uppercase();
    match s.split_once(':') {
        Some((exchange, token)) => NormalizedSymbol {
            exchange: if exchange.is_empty() {
                DEFAULT_EXCHANGE.to_string()
            } else {
                exchange.to_string()
            },
            token: token.to_string(),
        },
        None => NormalizedSymbol {
            exchange: DEFAULT_EXCHANGE.to_string(),
            token: s,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    broker: String,
    #[serde(default)]
    items: Vec<SymbolInfo>,
}

/// Symbols a source offers, as reported by the options service.
#[derive(Debug, Clone, Default)]
pub struct SymbolCatalog {
    broker: String,
    items: Vec<SymbolInfo>,
    index: HashSet<NormalizedSymbol>,
}

impl SymbolCatalog {
    pub fn new(broker: impl Into<String>, items: Vec<SymbolInfo>) -> Self {
        let index = items.iter().map(|i| normalize_symbol(&i.symbol)).collect();
        Self {
            broker: broker.into(),
            items,
            index,
        }
    }

    pub fn from_json(body: &str) -> Result<Self, AppError> {
        let resp: SymbolsResponse = serde_json::from_str(body)?;
        Ok(Self::new(resp.broker, resp.items))
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn items(&self) -> &[SymbolInfo] {
        &self.items
    }

    pub fn is_known(&self, symbol: &str) -> bool {
        self.index.contains(&normalize_symbol(symbol))
    }

    /// Symbols from `symbols` the catalog does not list, in input order.
    pub fn unknown<'a, I>(&self, symbols: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        symbols
            .into_iter()
            .filter(|s| !self.is_known(s))
            .cloned()
            .collect()
    }
}

/// Client for the symbol-metadata HTTP service.
pub struct SymbolServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl SymbolServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch_catalog(
        &self,
        source: &str,
        market_open: bool,
    ) -> Result<SymbolCatalog, AppError> {
        let url = format!("{}/api/symbols", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-Broker", source)
            .header("X-Market-Open", if market_open { "true" } else { "false" })
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AppError::SymbolService {
                status: status.as_u16(),
                msg: body,
            });
        }
        let catalog = SymbolCatalog::from_json(&body)?;
        tracing::debug!(
            broker = %catalog.broker(),
            count = catalog.items().len(),
            "Fetched symbol catalog"
        );
        Ok(catalog)
    }
}

// =============================================================================
// Binance Futures Client — public market-data endpoints only
// =============================================================================
//
// Trimmed from the donor's signed account/order client (`get_account`,
// `place_order`, `cancel_order`, HMAC request signing) down to the one
// unsigned `fapi` endpoint this engine's ambient surface needs directly:
// the venue's symbol list for `/exchange-info`. The depth snapshot path
// lives on `market_data::snapshot::SnapshotFetcher`, which is driven by
// the per-symbol backoff gates rather than this client. Execution and
// account management are external collaborators' concern, not this crate's.
// =============================================================================

use anyhow::Context;
use tracing::instrument;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /fapi/v1/exchangeInfo` — the venue's tradable symbol list.
    #[instrument(skip(self))]
    pub async fn get_exchange_info(&self) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.http.get(&url).send().await.context("exchangeInfo request failed")?;
        resp.error_for_status_ref().context("exchangeInfo returned an error status")?;
        resp.json().await.context("exchangeInfo body not valid JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_url_points_at_fapi() {
        let client = BinanceClient::new();
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn with_base_url_overrides_default() {
        let client = BinanceClient::new().with_base_url("http://localhost:1234");
        assert_eq!(client.base_url(), "http://localhost:1234");
    }
}

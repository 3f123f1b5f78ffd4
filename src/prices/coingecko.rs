use crate::assets::Asset;
use crate::prices::{PriceError, QuoteProvider};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Symbols we know how to translate to coingecko coin ids. Anything absent
/// here makes the provider decline, letting a bridge or another provider
/// take over.
const COIN_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("ADA", "cardano"),
    ("DOT", "polkadot"),
    ("SOL", "solana"),
    ("XRP", "ripple"),
    ("LTC", "litecoin"),
    ("DOGE", "dogecoin"),
    ("ATOM", "cosmos"),
    ("XMR", "monero"),
    ("BNB", "binancecoin"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
    ("XLM", "stellar"),
    ("ETC", "ethereum-classic"),
];

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    current_price: HashMap<String, Decimal>,
}

/// Daily quotes from the coingecko `/coins/{id}/history` endpoint.
pub struct CoingeckoProvider {
    agent: ureq::Agent,
    api_key: Option<String>,
}

impl CoingeckoProvider {
    pub fn new(timeout_secs: u64, api_key: Option<String>) -> CoingeckoProvider {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(timeout_secs))
            .build();
        CoingeckoProvider { agent, api_key }
    }

    fn coin_id(symbol: &str) -> Option<&'static str> {
        COIN_IDS
            .iter()
            .find(|(sym, _)| *sym == symbol)
            .map(|(_, id)| *id)
    }
}

impl QuoteProvider for CoingeckoProvider {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn try_quote(
        &self,
        asset: &Asset,
        day: NaiveDate,
        quote: &Asset,
    ) -> Result<Option<Decimal>, PriceError> {
        let coin_id = match Self::coin_id(asset.symbol()) {
            Some(id) => id,
            None => return Ok(None),
        };
        let vs_currency = quote.symbol().to_lowercase();

        let url = format!("https://api.coingecko.com/api/v3/coins/{coin_id}/history");
        let mut request = self
            .agent
            .get(&url)
            .query("date", &day.format("%d-%m-%Y").to_string())
            .query("localization", "false");
        if let Some(key) = &self.api_key {
            request = request.query("x_cg_demo_api_key", key);
        }

        // Any transport problem, timeout included, counts as a decline so
        // the oracle can move on to the next provider or bridge.
        let response = match request.call() {
            Ok(response) => response,
            Err(err) => {
                log::warn!("coingecko {coin_id}@{day}: {err}");
                return Ok(None);
            }
        };

        let parsed: HistoryResponse = match response.into_json() {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("coingecko {coin_id}@{day}: bad response body: {err}");
                return Ok(None);
            }
        };

        let price = parsed
            .market_data
            .and_then(|m| m.current_price.get(&vs_currency).copied())
            .filter(|p| *p > Decimal::ZERO);
        if let Some(price) = price {
            log::debug!("coingecko {}/{} @ {day} = {price}", asset, quote);
        }
        Ok(price)
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an asset for tax treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    /// The reporting currency itself
    FiatEur,
    /// Government currency other than EUR
    FiatOther,
    Crypto,
}

/// Fiat tickers other than EUR that we recognise as such. Anything not listed
/// here (and not EUR) is classified as crypto.
const FIAT_SYMBOLS: &[&str] = &[
    "USD", "GBP", "CHF", "JPY", "AUD", "CAD", "NZD", "SEK", "NOK", "DKK", "PLN", "CZK", "HUF",
];

/// A case-normalized ticker symbol with its classification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    symbol: String,
    class: AssetClass,
}

impl Asset {
    pub fn new(symbol: &str) -> Asset {
        let symbol = symbol.trim().to_uppercase();
        let class = if symbol == "EUR" {
            AssetClass::FiatEur
        } else if FIAT_SYMBOLS.contains(&symbol.as_str()) {
            AssetClass::FiatOther
        } else {
            AssetClass::Crypto
        };
        Asset { symbol, class }
    }

    /// The reporting numeraire
    pub fn eur() -> Asset {
        Asset {
            symbol: "EUR".to_string(),
            class: AssetClass::FiatEur,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn class(&self) -> AssetClass {
        self.class
    }

    pub fn is_eur(&self) -> bool {
        self.class == AssetClass::FiatEur
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

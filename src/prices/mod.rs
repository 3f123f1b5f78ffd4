pub mod cache;
pub mod coingecko;

use crate::assets::Asset;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

pub use cache::{CachedQuote, PriceCache};
pub use coingecko::CoingeckoProvider;

/// Days the oracle may walk back looking for the nearest earlier quote
pub const FALLBACK_WINDOW_DAYS: i64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("no EUR price for {asset} on {day} within the {window}-day fallback window")]
    MissingPrice {
        asset: String,
        day: NaiveDate,
        window: i64,
    },
    #[error("price cache io: {0}")]
    CacheIo(#[from] std::io::Error),
}

/// A resolved EUR valuation. `legs` records every quote used when the price
/// came through a cross-rate bridge; `fallback_days` is non-zero when an
/// earlier day's quote was substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct Quotation {
    pub price: Decimal,
    pub source_tag: String,
    pub legs: Vec<String>,
    pub fallback_days: i64,
}

/// An upstream quote source. Returning `Ok(None)` means the provider
/// declines for that key (including timeouts); hard errors are logged by the
/// oracle and likewise count as declines.
pub trait QuoteProvider {
    fn name(&self) -> &str;

    /// Quote one unit of `asset` in `quote` currency for the given day.
    fn try_quote(
        &self,
        asset: &Asset,
        day: NaiveDate,
        quote: &Asset,
    ) -> Result<Option<Decimal>, PriceError>;
}

/// Deterministic EUR valuation for `(asset, instant)` pairs: intrinsic EUR,
/// then the disk cache, then the provider registry, then cross-rate bridges,
/// with a bounded nearest-earlier-day fallback.
pub struct PriceOracle {
    cache: PriceCache,
    providers: Vec<Box<dyn QuoteProvider>>,
    bridges: Vec<Asset>,
}

impl PriceOracle {
    pub fn new(cache: PriceCache, providers: Vec<Box<dyn QuoteProvider>>) -> PriceOracle {
        PriceOracle {
            cache,
            providers,
            bridges: vec![Asset::new("USD")],
        }
    }

    pub fn with_bridges(mut self, bridges: Vec<Asset>) -> PriceOracle {
        self.bridges = bridges;
        self
    }

    /// EUR price of one unit of `asset` at `instant`, at daily resolution.
    pub fn price_eur(
        &mut self,
        asset: &Asset,
        instant: DateTime<Utc>,
    ) -> Result<Quotation, PriceError> {
        if asset.is_eur() {
            return Ok(Quotation {
                price: dec!(1),
                source_tag: "intrinsic".to_string(),
                legs: Vec::new(),
                fallback_days: 0,
            });
        }

        let day = instant.date_naive();
        for offset in 0..=FALLBACK_WINDOW_DAYS {
            let probe = day - Duration::days(offset);
            if let Some(mut quotation) = self.quote_for_day(asset, probe) {
                quotation.fallback_days = offset;
                return Ok(quotation);
            }
        }

        Err(PriceError::MissingPrice {
            asset: asset.symbol().to_string(),
            day,
            window: FALLBACK_WINDOW_DAYS,
        })
    }

    /// Resolve a quote for exactly one day: cache, then direct provider
    /// quotes, then the first bridge that yields both legs.
    fn quote_for_day(&mut self, asset: &Asset, day: NaiveDate) -> Option<Quotation> {
        if let Some(cached) = self.cache.get(asset.symbol(), day) {
            return Some(Quotation {
                price: cached.price,
                source_tag: cached.source_tag.clone(),
                legs: Vec::new(),
                fallback_days: 0,
            });
        }

        let eur = Asset::eur();
        for provider in &self.providers {
            match provider.try_quote(asset, day, &eur) {
                Ok(Some(price)) => {
                    self.cache.insert(asset.symbol(), day, price, provider.name());
                    return Some(Quotation {
                        price,
                        source_tag: provider.name().to_string(),
                        legs: Vec::new(),
                        fallback_days: 0,
                    });
                }
                Ok(None) => continue,
                Err(err) => {
                    log::warn!(
                        "provider {} failed for {}@{}: {err}",
                        provider.name(),
                        asset,
                        day
                    );
                    continue;
                }
            }
        }

        let bridges = self.bridges.clone();
        for bridge in &bridges {
            if let Some(quotation) = self.bridge_quote(asset, day, bridge) {
                return Some(quotation);
            }
        }
        None
    }

    /// `price_eur(A) = price_X(A) * price_eur(X)` for a bridge currency X.
    fn bridge_quote(&mut self, asset: &Asset, day: NaiveDate, bridge: &Asset) -> Option<Quotation> {
        let mut asset_in_bridge = None;
        let mut first_provider = String::new();
        for provider in &self.providers {
            match provider.try_quote(asset, day, bridge) {
                Ok(Some(price)) => {
                    asset_in_bridge = Some(price);
                    first_provider = provider.name().to_string();
                    break;
                }
                Ok(None) => continue,
                Err(err) => {
                    log::warn!(
                        "provider {} failed for {}/{}@{}: {err}",
                        provider.name(),
                        asset,
                        bridge,
                        day
                    );
                    continue;
                }
            }
        }
        let asset_in_bridge = asset_in_bridge?;

        let bridge_eur = self.bridge_leg_eur(bridge, day)?;

        let price = asset_in_bridge * bridge_eur.0;
        let source_tag = format!("cross:{}", bridge.symbol());
        self.cache.insert(asset.symbol(), day, price, &source_tag);
        Some(Quotation {
            price,
            source_tag,
            legs: vec![
                format!(
                    "{}/{}={} via {}",
                    asset.symbol(),
                    bridge.symbol(),
                    asset_in_bridge,
                    first_provider
                ),
                format!("{}/EUR={} via {}", bridge.symbol(), bridge_eur.0, bridge_eur.1),
            ],
            fallback_days: 0,
        })
    }

    /// The EUR side of a bridge: cache first, then direct provider quotes.
    fn bridge_leg_eur(&mut self, bridge: &Asset, day: NaiveDate) -> Option<(Decimal, String)> {
        if let Some(cached) = self.cache.get(bridge.symbol(), day) {
            return Some((cached.price, cached.source_tag.clone()));
        }
        let eur = Asset::eur();
        for provider in &self.providers {
            if let Ok(Some(price)) = provider.try_quote(bridge, day, &eur) {
                self.cache.insert(bridge.symbol(), day, price, provider.name());
                return Some((price, provider.name().to_string()));
            }
        }
        None
    }

    /// Warm the cache for every distinct `(asset, day)` pair ahead of the
    /// engine run. Missing quotes are left for the engine to surface per
    /// event; cache io failures are retried once and then dropped.
    pub fn prewarm(&mut self, pairs: impl IntoIterator<Item = (Asset, NaiveDate)>) {
        let mut fetched = 0usize;
        for (asset, day) in pairs {
            if asset.is_eur() || self.cache.get(asset.symbol(), day).is_some() {
                continue;
            }
            if self.quote_for_day(&asset, day).is_some() {
                fetched += 1;
            }
        }
        if fetched > 0 {
            log::info!("prewarmed {fetched} price cache entries");
        }
        self.commit();
    }

    /// Flush cached quotes to disk. An io failure is retried once; a second
    /// failure is logged and treated like a provider decline, leaving the
    /// in-memory view intact.
    pub fn commit(&mut self) {
        if let Err(first) = self.cache.commit() {
            log::warn!("price cache commit failed, retrying: {first}");
            if let Err(second) = self.cache.commit() {
                log::warn!("price cache commit failed twice, continuing without: {second}");
            }
        }
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }
}

/// In-memory provider with pinned quotes, used to make test runs
/// reproducible.
#[derive(Default)]
pub struct FixedProvider {
    quotes: HashMap<(String, NaiveDate, String), Decimal>,
}

impl FixedProvider {
    pub fn new() -> FixedProvider {
        FixedProvider::default()
    }

    pub fn quote(mut self, asset: &str, day: NaiveDate, quote: &str, price: Decimal) -> Self {
        self.quotes.insert(
            (
                asset.trim().to_uppercase(),
                day,
                quote.trim().to_uppercase(),
            ),
            price,
        );
        self
    }
}

impl QuoteProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    fn try_quote(
        &self,
        asset: &Asset,
        day: NaiveDate,
        quote: &Asset,
    ) -> Result<Option<Decimal>, PriceError> {
        Ok(self
            .quotes
            .get(&(
                asset.symbol().to_string(),
                day,
                quote.symbol().to_string(),
            ))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(
            s[0..4].parse().unwrap(),
            s[5..7].parse().unwrap(),
            s[8..10].parse().unwrap(),
            12,
            0,
            0,
        )
        .unwrap()
    }

    fn empty_cache() -> PriceCache {
        let tmp = tempfile::tempdir().unwrap();
        // The directory outlives the cache only for the duration of a test;
        // commits are not exercised here.
        PriceCache::open(tmp.into_path().join("prices")).unwrap()
    }

    #[test]
    fn eur_is_intrinsic() {
        let mut oracle = PriceOracle::new(empty_cache(), vec![]);
        let quotation = oracle.price_eur(&Asset::eur(), at("2023-01-02")).unwrap();
        assert_eq!(quotation.price, dec!(1));
        assert_eq!(quotation.source_tag, "intrinsic");
    }

    #[test]
    fn cache_hit_short_circuits_providers() {
        let mut cache = empty_cache();
        cache.insert("BTC", day("2023-01-02"), dec!(20000), "pinned");
        let mut oracle = PriceOracle::new(cache, vec![]);

        let quotation = oracle
            .price_eur(&Asset::new("BTC"), at("2023-01-02"))
            .unwrap();
        assert_eq!(quotation.price, dec!(20000));
        assert_eq!(quotation.source_tag, "pinned");
        assert_eq!(quotation.fallback_days, 0);
    }

    #[test]
    fn provider_quote_is_cached() {
        let provider =
            FixedProvider::new().quote("BTC", day("2023-01-02"), "EUR", dec!(20000));
        let mut oracle = PriceOracle::new(empty_cache(), vec![Box::new(provider)]);

        oracle
            .price_eur(&Asset::new("BTC"), at("2023-01-02"))
            .unwrap();
        assert!(oracle.cache().get("BTC", day("2023-01-02")).is_some());
    }

    #[test]
    fn falls_back_to_nearest_earlier_day_within_window() {
        let mut cache = empty_cache();
        cache.insert("BTC", day("2023-01-02"), dec!(20000), "pinned");
        let mut oracle = PriceOracle::new(cache, vec![]);

        let quotation = oracle
            .price_eur(&Asset::new("BTC"), at("2023-01-06"))
            .unwrap();
        assert_eq!(quotation.price, dec!(20000));
        assert_eq!(quotation.fallback_days, 4);
    }

    #[test]
    fn fallback_window_is_bounded() {
        let mut cache = empty_cache();
        cache.insert("BTC", day("2023-01-02"), dec!(20000), "pinned");
        let mut oracle = PriceOracle::new(cache, vec![]);

        let err = oracle
            .price_eur(&Asset::new("BTC"), at("2023-01-10"))
            .unwrap_err();
        assert!(matches!(err, PriceError::MissingPrice { .. }));
    }

    #[test]
    fn cross_rate_bridges_through_usd() {
        let provider = FixedProvider::new()
            .quote("ADA", day("2023-02-01"), "USD", dec!(0.44))
            .quote("USD", day("2023-02-01"), "EUR", dec!(0.9));
        let mut oracle = PriceOracle::new(empty_cache(), vec![Box::new(provider)]);

        let quotation = oracle
            .price_eur(&Asset::new("ADA"), at("2023-02-01"))
            .unwrap();
        assert_eq!(quotation.price, dec!(0.396));
        assert_eq!(quotation.source_tag, "cross:USD");
        assert_eq!(quotation.legs.len(), 2);
    }

    #[test]
    fn missing_price_when_all_decline() {
        let mut oracle = PriceOracle::new(empty_cache(), vec![]);
        let err = oracle
            .price_eur(&Asset::new("XMR"), at("2023-01-02"))
            .unwrap_err();
        assert!(matches!(err, PriceError::MissingPrice { .. }));
    }
}

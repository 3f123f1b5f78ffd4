use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;

pub const ENV_PRICE_CACHE_DIR: &str = "QNTROPY_PRICE_CACHE_DIR";
pub const ENV_PRICE_PROVIDER: &str = "QNTROPY_PRICE_PROVIDER";
pub const ENV_PRICE_API_KEY: &str = "QNTROPY_PRICE_API_KEY";

/// Which upstream quote provider to register with the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Coingecko,
    /// Cache-only operation; every upstream lookup declines
    None,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<ProviderKind> {
        match s.to_lowercase().as_str() {
            "coingecko" => Some(ProviderKind::Coingecko),
            "none" => Some(ProviderKind::None),
            _ => None,
        }
    }
}

/// Policy for pairing an internal-transfer withdrawal with a later deposit.
/// Basis is never carried over without an explicit match rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMatching {
    Disabled,
    Window { hours: i64, pct_tolerance: Decimal },
}

impl TransferMatching {
    /// The 24h / ±0.5% default window
    pub fn default_window() -> TransferMatching {
        TransferMatching::Window {
            hours: 24,
            pct_tolerance: dec!(0.005),
        }
    }
}

/// Run configuration assembled from CLI flags overlaid with environment
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Timezone source timestamps are interpreted in, and the tax-year zone
    pub tz: Tz,
    /// Absolute quantity tolerance for final-balance consolidation
    pub tolerance: Decimal,
    pub price_cache_dir: PathBuf,
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    /// Treat unmapped source type strings as skipped rows instead of failing
    pub skip_unknown: bool,
    pub transfer_matching: TransferMatching,
    /// Recognise airdrops as income at FMV instead of zero-basis acquisitions
    pub airdrops_as_income: bool,
    /// Per-provider network timeout in seconds
    pub provider_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            tz: chrono_tz::Europe::Madrid,
            tolerance: dec!(0.00000001),
            price_cache_dir: PathBuf::from("prices"),
            provider: ProviderKind::default(),
            api_key: None,
            skip_unknown: false,
            transfer_matching: TransferMatching::Disabled,
            airdrops_as_income: false,
            provider_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Overlay `QNTROPY_*` environment variables onto this configuration.
    pub fn apply_env(mut self) -> Config {
        if let Ok(dir) = std::env::var(ENV_PRICE_CACHE_DIR) {
            if !dir.is_empty() {
                self.price_cache_dir = PathBuf::from(dir);
            }
        }
        if let Ok(provider) = std::env::var(ENV_PRICE_PROVIDER) {
            match ProviderKind::parse(&provider) {
                Some(kind) => self.provider = kind,
                None => log::warn!("ignoring unknown {ENV_PRICE_PROVIDER}={provider}"),
            }
        }
        if let Ok(key) = std::env::var(ENV_PRICE_API_KEY) {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
        self
    }
}

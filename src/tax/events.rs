use crate::assets::Asset;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Holding period classification for a disposal. `Long` means strictly more
/// than 12 months between the earliest consumed lot and the disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holding {
    Short,
    Long,
}

impl Holding {
    pub fn display(self) -> &'static str {
        match self {
            Holding::Short => "Short",
            Holding::Long => "Long",
        }
    }
}

/// IRPF income category for acquisition-side income
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncomeCategory {
    /// Rendimientos del capital mobiliario (staking, lending interest)
    MovableCapital,
    Other,
}

impl IncomeCategory {
    pub fn display(self) -> &'static str {
        match self {
            IncomeCategory::MovableCapital => "MovableCapital",
            IncomeCategory::Other => "Other",
        }
    }
}

/// The share of a single lot consumed by a disposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotShare {
    pub source_tx_id: String,
    pub acquired_at: DateTime<Utc>,
    pub qty: Decimal,
    pub basis_eur: Decimal,
}

/// Payload of a taxable event. Closed set: a disposal integrating into the
/// savings base, or income recognised at fair market value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaxEventKind {
    CapitalDisposal {
        asset: Asset,
        qty: Decimal,
        proceeds_eur: Decimal,
        cost_basis_eur: Decimal,
        gain_eur: Decimal,
        holding: Holding,
        lots_consumed: Vec<LotShare>,
    },
    Income {
        asset: Asset,
        qty: Decimal,
        fmv_eur: Decimal,
        category: IncomeCategory,
    },
}

/// Emitted by the FIFO engine; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxEvent {
    pub kind: TaxEventKind,
    /// Calendar year of the instant in Europe/Madrid
    pub tax_year: i32,
    pub instant: DateTime<Utc>,
    pub source_tx_id: String,
    /// True when any synthetic transaction appears in this event's ancestry
    pub synthetic_inputs: bool,
}

impl TaxEvent {
    pub fn asset(&self) -> &Asset {
        match &self.kind {
            TaxEventKind::CapitalDisposal { asset, .. } => asset,
            TaxEventKind::Income { asset, .. } => asset,
        }
    }
}

/// Spanish tax years follow the calendar year, in local (Madrid) time.
pub fn tax_year(instant: DateTime<Utc>) -> i32 {
    instant.with_timezone(&chrono_tz::Europe::Madrid).year()
}

/// Round an EUR value for a reporting boundary. Intermediate arithmetic is
/// never rounded with this.
pub fn round_eur(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    RowSkipped,
    SyntheticInserted,
    PriceFallback,
    ToleranceDrop,
    LotSplit,
    Diagnostic,
}

impl AuditCategory {
    pub fn display(self) -> &'static str {
        match self {
            AuditCategory::RowSkipped => "RowSkipped",
            AuditCategory::SyntheticInserted => "SyntheticInserted",
            AuditCategory::PriceFallback => "PriceFallback",
            AuditCategory::ToleranceDrop => "ToleranceDrop",
            AuditCategory::LotSplit => "LotSplit",
            AuditCategory::Diagnostic => "Diagnostic",
        }
    }
}

/// Record of a reconciliation or valuation action that altered or annotated
/// the stream, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instant: DateTime<Utc>,
    pub category: AuditCategory,
    pub subject_tx_id: Option<String>,
    pub reason: String,
}

impl AuditEntry {
    pub fn new(
        instant: DateTime<Utc>,
        category: AuditCategory,
        subject_tx_id: Option<String>,
        reason: impl Into<String>,
    ) -> AuditEntry {
        AuditEntry {
            instant,
            category,
            subject_tx_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn tax_year_uses_madrid_local_time() {
        // 23:30 UTC on New Year's Eve is already next year in Madrid (UTC+1)
        let instant = Utc.with_ymd_and_hms(2023, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(tax_year(instant), 2024);

        let instant = Utc.with_ymd_and_hms(2023, 12, 31, 22, 30, 0).unwrap();
        assert_eq!(tax_year(instant), 2023);
    }

    #[test]
    fn eur_rounding_is_half_even() {
        assert_eq!(round_eur(dec!(1.005)), dec!(1.00));
        assert_eq!(round_eur(dec!(1.015)), dec!(1.02));
        assert_eq!(round_eur(dec!(1.0149)), dec!(1.01));
    }
}

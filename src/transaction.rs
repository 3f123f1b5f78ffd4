use crate::assets::Asset;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("trade must have both legs: {id}")]
    TradeMissingLeg { id: String },
    #[error("trade legs must be on distinct assets: {id}")]
    TradeSameAsset { id: String },
    #[error("{kind} must not have an out leg: {id}")]
    UnexpectedOutLeg { id: String, kind: String },
    #[error("{kind} must not have an in leg: {id}")]
    UnexpectedInLeg { id: String, kind: String },
    #[error("{kind} must have a {leg} leg: {id}")]
    MissingLeg {
        id: String,
        kind: String,
        leg: &'static str,
    },
    #[error("fee-only transaction must carry only a fee leg: {id}")]
    FeeOnlyExtraLeg { id: String },
    #[error("leg amount must be positive: {id}")]
    NonPositiveAmount { id: String },
    #[error("synthetic transaction requires an origin note: {id}")]
    MissingOriginNote { id: String },
}

/// Canonical transaction kind. Closed set; every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Deposit,
    Withdrawal,
    Trade,
    StakingReward,
    LendingInterest,
    Airdrop,
    Fork,
    FeeOnly,
    TransferInternal,
    Income,
    SyntheticBalancingDeposit,
    SyntheticConsolidation,
}

impl TxKind {
    /// Sort key for equal-instant transactions: acquisitions must post before
    /// disposals so FIFO consumption is deterministic.
    pub fn priority(self) -> u8 {
        match self {
            TxKind::Deposit
            | TxKind::SyntheticBalancingDeposit
            | TxKind::SyntheticConsolidation => 0,
            TxKind::StakingReward
            | TxKind::LendingInterest
            | TxKind::Airdrop
            | TxKind::Fork
            | TxKind::Income => 1,
            TxKind::Trade => 2,
            TxKind::Withdrawal | TxKind::TransferInternal => 3,
            TxKind::FeeOnly => 4,
        }
    }

    pub fn display(self) -> &'static str {
        match self {
            TxKind::Deposit => "Deposit",
            TxKind::Withdrawal => "Withdrawal",
            TxKind::Trade => "Trade",
            TxKind::StakingReward => "StakingReward",
            TxKind::LendingInterest => "LendingInterest",
            TxKind::Airdrop => "Airdrop",
            TxKind::Fork => "Fork",
            TxKind::FeeOnly => "FeeOnly",
            TxKind::TransferInternal => "TransferInternal",
            TxKind::Income => "Income",
            TxKind::SyntheticBalancingDeposit => "SyntheticBalancingDeposit",
            TxKind::SyntheticConsolidation => "SyntheticConsolidation",
        }
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// An amount of a specific asset attached to one side of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub asset: Asset,
    pub amount: Decimal,
}

impl Leg {
    pub fn new(asset: Asset, amount: Decimal) -> Leg {
        Leg { asset, amount }
    }
}

/// Canonical transaction record produced by the normalization layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    /// Stable identifier: source file stem plus row ordinal
    pub id: String,
    /// UTC instant, normalized at parse time
    pub instant: DateTime<Utc>,
    pub kind: TxKind,
    pub in_leg: Option<Leg>,
    pub out_leg: Option<Leg>,
    pub fee_leg: Option<Leg>,
    pub venue: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub synthetic: bool,
    /// Required whenever `synthetic` is set
    #[serde(default)]
    pub origin_note: Option<String>,
    /// Source row ordinal, used as the equal-instant tiebreaker
    pub ordinal: usize,
}

impl Tx {
    /// Check the per-kind leg invariants.
    pub fn validate(&self) -> Result<(), TxError> {
        for leg in [&self.in_leg, &self.out_leg, &self.fee_leg].into_iter().flatten() {
            if leg.amount <= Decimal::ZERO {
                return Err(TxError::NonPositiveAmount {
                    id: self.id.clone(),
                });
            }
        }

        if self.synthetic
            && self
                .origin_note
                .as_ref()
                .map(|n| n.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(TxError::MissingOriginNote {
                id: self.id.clone(),
            });
        }

        let kind = self.kind.display().to_string();
        match self.kind {
            TxKind::Trade => {
                let (in_leg, out_leg) = match (&self.in_leg, &self.out_leg) {
                    (Some(i), Some(o)) => (i, o),
                    _ => {
                        return Err(TxError::TradeMissingLeg {
                            id: self.id.clone(),
                        })
                    }
                };
                if in_leg.asset == out_leg.asset {
                    return Err(TxError::TradeSameAsset {
                        id: self.id.clone(),
                    });
                }
                Ok(())
            }
            TxKind::Deposit
            | TxKind::StakingReward
            | TxKind::LendingInterest
            | TxKind::Airdrop
            | TxKind::Fork
            | TxKind::Income
            | TxKind::SyntheticBalancingDeposit => {
                if self.out_leg.is_some() {
                    return Err(TxError::UnexpectedOutLeg {
                        id: self.id.clone(),
                        kind,
                    });
                }
                if self.in_leg.is_none() {
                    return Err(TxError::MissingLeg {
                        id: self.id.clone(),
                        kind,
                        leg: "in",
                    });
                }
                Ok(())
            }
            TxKind::Withdrawal | TxKind::TransferInternal => {
                if self.in_leg.is_some() {
                    return Err(TxError::UnexpectedInLeg {
                        id: self.id.clone(),
                        kind,
                    });
                }
                if self.out_leg.is_none() {
                    return Err(TxError::MissingLeg {
                        id: self.id.clone(),
                        kind,
                        leg: "out",
                    });
                }
                Ok(())
            }
            TxKind::FeeOnly => {
                if self.in_leg.is_some() || self.out_leg.is_some() || self.fee_leg.is_none() {
                    return Err(TxError::FeeOnlyExtraLeg {
                        id: self.id.clone(),
                    });
                }
                Ok(())
            }
            // Direction determined by which leg is present; either is valid.
            TxKind::SyntheticConsolidation => {
                if self.in_leg.is_some() == self.out_leg.is_some() {
                    return Err(TxError::MissingLeg {
                        id: self.id.clone(),
                        kind,
                        leg: "in or out",
                    });
                }
                Ok(())
            }
        }
    }
}

/// Sort a transaction stream into its canonical total order:
/// `(instant, kind priority, source ordinal)`. Idempotent.
pub fn sort_stream(txs: &mut [Tx]) {
    txs.sort_by(|a, b| {
        a.instant
            .cmp(&b.instant)
            .then(a.kind.priority().cmp(&b.kind.priority()))
            .then(a.ordinal.cmp(&b.ordinal))
    });
}

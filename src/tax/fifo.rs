use crate::assets::Asset;
use crate::config::{Config, TransferMatching};
use crate::prices::{PriceError, PriceOracle};
use crate::reconcile::{deltas, negative_tolerance};
use crate::tax::events::{
    tax_year, AuditCategory, AuditEntry, Holding, IncomeCategory, LotShare, TaxEvent, TaxEventKind,
};
use crate::transaction::{Tx, TxKind};
use chrono::{DateTime, Months, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    /// The lot ledger drifted from the reconciled balances; carries a dump
    /// of the offending state.
    #[error("lot ledger invariant violated: {0}")]
    Invariant(String),
}

/// Unit of acquisition held in a per-asset FIFO queue
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub asset: Asset,
    pub qty_remaining: Decimal,
    pub acquired_at: DateTime<Utc>,
    pub unit_basis_eur: Decimal,
    pub source_tx_id: String,
    /// True when a synthetic transaction appears anywhere in this lot's
    /// ancestry
    pub synthetic: bool,
}

/// Result of a full engine pass: the emitted events, the audit trail, and
/// whether any valuation fell through the oracle (run must not be treated as
/// final in that case).
#[derive(Debug, Default)]
pub struct TaxComputation {
    pub events: Vec<TaxEvent>,
    pub audits: Vec<AuditEntry>,
    pub needs_price: bool,
}

/// Lots sliced off the head of a queue to satisfy a disposal
struct Consumed {
    shares: Vec<LotShare>,
    basis: Decimal,
    earliest: Option<DateTime<Utc>>,
    synthetic: bool,
}

/// A withdrawal marked as internal transfer whose lots are parked until the
/// matching deposit shows up
struct PendingTransfer {
    asset: Asset,
    qty: Decimal,
    withdrawn_at: DateTime<Utc>,
    lots: Vec<Lot>,
}

/// FIFO lot engine with tax classification. Consumes the reconciled stream
/// in order, maintains per-asset acquisition queues and emits taxable
/// events. EUR itself is the numeraire and is never lot-tracked.
pub struct FifoEngine {
    transfer_matching: TransferMatching,
    airdrops_as_income: bool,
    queues: HashMap<Asset, VecDeque<Lot>>,
    balances: HashMap<Asset, Decimal>,
    pending_transfers: Vec<PendingTransfer>,
}

impl FifoEngine {
    pub fn new(config: &Config) -> FifoEngine {
        FifoEngine {
            transfer_matching: config.transfer_matching.clone(),
            airdrops_as_income: config.airdrops_as_income,
            queues: HashMap::new(),
            balances: HashMap::new(),
            pending_transfers: Vec::new(),
        }
    }

    /// Run the engine over a reconciled, time-sorted stream.
    pub fn process(
        &mut self,
        txs: &[Tx],
        oracle: &mut PriceOracle,
    ) -> Result<TaxComputation, FifoError> {
        let mut out = TaxComputation::default();
        for tx in txs {
            self.apply(tx, oracle, &mut out)?;
            self.apply_balance_deltas(tx);
            self.check_lot_sums(tx)?;
        }
        Ok(out)
    }

    /// Remaining lots per asset, oldest first (for reporting and tests).
    pub fn open_lots(&self, asset: &Asset) -> Vec<Lot> {
        self.queues
            .get(asset)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn apply(
        &mut self,
        tx: &Tx,
        oracle: &mut PriceOracle,
        out: &mut TaxComputation,
    ) -> Result<(), FifoError> {
        match tx.kind {
            TxKind::Deposit => self.apply_deposit(tx, oracle, out),
            TxKind::SyntheticBalancingDeposit => {
                let leg = tx.in_leg.as_ref().expect("validated");
                self.push_lot(tx, &leg.asset, leg.amount, Decimal::ZERO, true);
            }
            TxKind::SyntheticConsolidation => {
                if let Some(leg) = &tx.in_leg {
                    self.push_lot(tx, &leg.asset, leg.amount, Decimal::ZERO, true);
                } else if let Some(leg) = tx.out_leg.clone() {
                    let proceeds = self.value_eur(&leg.asset, leg.amount, tx, oracle, out);
                    self.dispose(tx, &leg.asset, leg.amount, proceeds, out);
                }
            }
            TxKind::StakingReward | TxKind::LendingInterest => {
                self.income_acquisition(tx, IncomeCategory::MovableCapital, oracle, out);
            }
            TxKind::Income => {
                self.income_acquisition(tx, IncomeCategory::Other, oracle, out);
            }
            TxKind::Airdrop | TxKind::Fork => {
                let leg = tx.in_leg.as_ref().expect("validated");
                if self.airdrops_as_income {
                    self.income_acquisition(tx, IncomeCategory::Other, oracle, out);
                } else {
                    self.push_lot(tx, &leg.asset, leg.amount, Decimal::ZERO, tx.synthetic);
                }
            }
            TxKind::Trade => self.apply_trade(tx, oracle, out),
            TxKind::Withdrawal => {
                if self.is_internal_transfer(tx) {
                    self.transfer_out(tx, out);
                } else {
                    self.apply_external_withdrawal(tx, oracle, out);
                }
            }
            TxKind::TransferInternal => self.transfer_out(tx, out),
            TxKind::FeeOnly => {
                let leg = tx.fee_leg.as_ref().expect("validated").clone();
                if tracked(&leg.asset) {
                    // The fee is already a disposal of the asset; proceeds
                    // are zero, so the basis surfaces as a loss.
                    self.dispose(tx, &leg.asset, leg.amount, Some(Decimal::ZERO), out);
                }
            }
        }
        Ok(())
    }

    /// Deposit handling: internal transfers may carry basis over under the
    /// configured match rule; everything else is an acquisition at fair
    /// market value.
    fn apply_deposit(&mut self, tx: &Tx, oracle: &mut PriceOracle, out: &mut TaxComputation) {
        let leg = tx.in_leg.as_ref().expect("validated").clone();
        if !tracked(&leg.asset) {
            return;
        }

        if self.is_internal_transfer(tx) {
            match self.transfer_matching.clone() {
                TransferMatching::Disabled => {
                    out.audits.push(AuditEntry::new(
                        tx.instant,
                        AuditCategory::LotSplit,
                        Some(tx.id.clone()),
                        format!(
                            "internal-transfer deposit of {} {} without destination tracking; new zero-basis lot",
                            leg.amount, leg.asset
                        ),
                    ));
                    self.push_lot(tx, &leg.asset, leg.amount, Decimal::ZERO, tx.synthetic);
                    return;
                }
                TransferMatching::Window { hours, pct_tolerance } => {
                    if self.restore_transfer(tx, &leg.asset, leg.amount, hours, pct_tolerance, out)
                    {
                        return;
                    }
                    out.audits.push(AuditEntry::new(
                        tx.instant,
                        AuditCategory::Diagnostic,
                        Some(tx.id.clone()),
                        format!(
                            "internal-transfer deposit of {} {} has no matching withdrawal; treated as acquisition",
                            leg.amount, leg.asset
                        ),
                    ));
                }
            }
        }

        let unit_basis = self
            .unit_price(&leg.asset, tx, oracle, out)
            .unwrap_or(Decimal::ZERO);
        self.push_lot(tx, &leg.asset, leg.amount, unit_basis, tx.synthetic);
    }

    /// Reward-type acquisition: lot at FMV plus an income event.
    fn income_acquisition(
        &mut self,
        tx: &Tx,
        category: IncomeCategory,
        oracle: &mut PriceOracle,
        out: &mut TaxComputation,
    ) {
        let leg = tx.in_leg.as_ref().expect("validated").clone();
        if !tracked(&leg.asset) {
            return;
        }
        let unit_basis = self
            .unit_price(&leg.asset, tx, oracle, out)
            .unwrap_or(Decimal::ZERO);
        self.push_lot(tx, &leg.asset, leg.amount, unit_basis, tx.synthetic);
        out.events.push(TaxEvent {
            kind: TaxEventKind::Income {
                asset: leg.asset.clone(),
                qty: leg.amount,
                fmv_eur: leg.amount * unit_basis,
                category,
            },
            tax_year: tax_year(tx.instant),
            instant: tx.instant,
            source_tx_id: tx.id.clone(),
            synthetic_inputs: tx.synthetic,
        });
    }

    fn apply_trade(&mut self, tx: &Tx, oracle: &mut PriceOracle, out: &mut TaxComputation) {
        let in_leg = tx.in_leg.as_ref().expect("validated").clone();
        let out_leg = tx.out_leg.as_ref().expect("validated").clone();

        // The trade's EUR value: a fiat-EUR leg fixes it exactly, otherwise
        // the acquired side is valued at fair market.
        let trade_value = if out_leg.asset.is_eur() {
            Some(out_leg.amount)
        } else if in_leg.asset.is_eur() {
            Some(in_leg.amount)
        } else {
            self.value_eur(&in_leg.asset, in_leg.amount, tx, oracle, out)
        };

        let fee = tx.fee_leg.clone();
        let fee_eur = match &fee {
            Some(leg) => self.value_eur(&leg.asset, leg.amount, tx, oracle, out),
            None => Some(Decimal::ZERO),
        };

        let has_disposal = tracked(&out_leg.asset);
        let has_acquisition = tracked(&in_leg.asset);

        // Disposal side first: it may only consume lots that already existed
        // before this trade.
        let mut disposal_synthetic = false;
        if has_disposal {
            let mut qty = out_leg.amount;
            if let Some(fee_leg) = &fee {
                if fee_leg.asset == out_leg.asset {
                    qty += fee_leg.amount;
                }
            }
            let proceeds = match (trade_value, fee_eur) {
                (Some(value), Some(fee_eur)) => Some(value - fee_eur),
                _ => None,
            };
            disposal_synthetic = self.dispose(tx, &out_leg.asset, qty, proceeds, out);
        }

        if has_acquisition {
            // Acquisition-side fees increase basis; when the trade also has
            // a tracked disposal the fee was already netted from proceeds.
            let basis_total = match (trade_value, fee_eur) {
                (Some(value), Some(fee_eur)) if !has_disposal => value + fee_eur,
                (Some(value), _) => value,
                (None, _) => Decimal::ZERO,
            };
            let unit_basis = if in_leg.amount.is_zero() {
                Decimal::ZERO
            } else {
                (basis_total / in_leg.amount)
                    .round_dp_with_strategy(18, RoundingStrategy::MidpointNearestEven)
            };
            // Ancestry flows through swaps: a lot bought with synthetic
            // inputs stays marked.
            let synthetic = tx.synthetic || disposal_synthetic;
            self.push_lot(tx, &in_leg.asset, in_leg.amount, unit_basis, synthetic);
        }

        // A fee in an asset that is neither leg (nor EUR) is its own
        // simultaneous disposal at fair value.
        if let Some(fee_leg) = &fee {
            if tracked(&fee_leg.asset)
                && fee_leg.asset != out_leg.asset
                && fee_leg.asset != in_leg.asset
            {
                self.dispose(tx, &fee_leg.asset, fee_leg.amount, fee_eur, out);
            }
            if tracked(&fee_leg.asset) && fee_leg.asset == in_leg.asset {
                // Fee paid out of the acquired units; consume them right back
                self.dispose(tx, &fee_leg.asset, fee_leg.amount, fee_eur, out);
            }
        }
    }

    fn apply_external_withdrawal(
        &mut self,
        tx: &Tx,
        oracle: &mut PriceOracle,
        out: &mut TaxComputation,
    ) {
        let out_leg = tx.out_leg.as_ref().expect("validated").clone();
        let fee = tx.fee_leg.clone();
        let fee_eur = match &fee {
            Some(leg) => self.value_eur(&leg.asset, leg.amount, tx, oracle, out),
            None => Some(Decimal::ZERO),
        };

        if tracked(&out_leg.asset) {
            let mut qty = out_leg.amount;
            if let Some(fee_leg) = &fee {
                if fee_leg.asset == out_leg.asset {
                    qty += fee_leg.amount;
                }
            }
            let value = self.value_eur(&out_leg.asset, out_leg.amount, tx, oracle, out);
            let proceeds = match (value, fee_eur) {
                (Some(value), Some(fee_eur)) => Some(value - fee_eur),
                _ => None,
            };
            self.dispose(tx, &out_leg.asset, qty, proceeds, out);
        }

        if let Some(fee_leg) = &fee {
            if tracked(&fee_leg.asset) && fee_leg.asset != out_leg.asset {
                self.dispose(tx, &fee_leg.asset, fee_leg.amount, fee_eur, out);
            }
        }
    }

    /// Internal transfer out: no disposal. Lots leave the queue; with
    /// destination tracking they are parked for the matching deposit,
    /// otherwise their basis is dropped and audited.
    fn transfer_out(&mut self, tx: &Tx, out: &mut TaxComputation) {
        let out_leg = tx.out_leg.as_ref().expect("validated").clone();
        if !tracked(&out_leg.asset) {
            return;
        }

        let consumed = self.consume(tx, &out_leg.asset, out_leg.amount, out);
        match &self.transfer_matching {
            TransferMatching::Window { .. } => {
                let lots = consumed
                    .shares
                    .iter()
                    .map(|share| Lot {
                        asset: out_leg.asset.clone(),
                        qty_remaining: share.qty,
                        acquired_at: share.acquired_at,
                        unit_basis_eur: if share.qty.is_zero() {
                            Decimal::ZERO
                        } else {
                            share.basis_eur / share.qty
                        },
                        source_tx_id: share.source_tx_id.clone(),
                        synthetic: consumed.synthetic,
                    })
                    .collect();
                self.pending_transfers.push(PendingTransfer {
                    asset: out_leg.asset.clone(),
                    qty: out_leg.amount,
                    withdrawn_at: tx.instant,
                    lots,
                });
            }
            TransferMatching::Disabled => {
                out.audits.push(AuditEntry::new(
                    tx.instant,
                    AuditCategory::LotSplit,
                    Some(tx.id.clone()),
                    format!(
                        "internal transfer out of {} {} drops basis {} (destination tracking disabled)",
                        out_leg.amount, out_leg.asset, consumed.basis
                    ),
                ));
            }
        }

        // Network fee on the transfer is still a disposal with no proceeds
        if let Some(fee_leg) = tx.fee_leg.clone() {
            if tracked(&fee_leg.asset) {
                self.dispose(tx, &fee_leg.asset, fee_leg.amount, Some(Decimal::ZERO), out);
            }
        }
    }

    /// Try to restore parked lots for an internal-transfer deposit. Returns
    /// true when a pending withdrawal matched within the window.
    fn restore_transfer(
        &mut self,
        tx: &Tx,
        asset: &Asset,
        qty: Decimal,
        hours: i64,
        pct_tolerance: Decimal,
        out: &mut TaxComputation,
    ) -> bool {
        let window = chrono::Duration::hours(hours);
        let position = self.pending_transfers.iter().position(|pending| {
            pending.asset == *asset
                && tx.instant >= pending.withdrawn_at
                && tx.instant - pending.withdrawn_at <= window
                && (pending.qty - qty).abs() <= pending.qty * pct_tolerance
        });
        let pending = match position {
            Some(idx) => self.pending_transfers.remove(idx),
            None => return false,
        };

        let mut remaining = qty;
        let queue = self.queues.entry(asset.clone()).or_default();
        for lot in pending.lots {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = lot.qty_remaining.min(remaining);
            remaining -= take;
            queue.push_back(Lot {
                qty_remaining: take,
                ..lot
            });
        }
        if remaining > Decimal::ZERO {
            // In-transit shrinkage beyond the carried lots gets zero basis
            out.audits.push(AuditEntry::new(
                tx.instant,
                AuditCategory::LotSplit,
                Some(tx.id.clone()),
                format!("transfer restore short by {remaining} {asset}; zero-basis filler lot"),
            ));
            self.push_lot(tx, asset, remaining, Decimal::ZERO, true);
        }
        log::debug!(
            "matched internal transfer of {} {} (withdrawn {})",
            qty,
            asset,
            pending.withdrawn_at
        );
        true
    }

    /// Pop lot slices off the head of the queue until `qty` is covered.
    fn consume(
        &mut self,
        tx: &Tx,
        asset: &Asset,
        qty: Decimal,
        out: &mut TaxComputation,
    ) -> Consumed {
        let mut consumed = Consumed {
            shares: Vec::new(),
            basis: Decimal::ZERO,
            earliest: None,
            synthetic: false,
        };
        let mut remaining = qty;
        let queue = self.queues.entry(asset.clone()).or_default();

        while remaining > Decimal::ZERO {
            let lot = match queue.front_mut() {
                Some(lot) => lot,
                None => break,
            };
            let take = lot.qty_remaining.min(remaining);
            let share = LotShare {
                source_tx_id: lot.source_tx_id.clone(),
                acquired_at: lot.acquired_at,
                qty: take,
                basis_eur: take * lot.unit_basis_eur,
            };
            consumed.basis += share.basis_eur;
            consumed.earliest = Some(match consumed.earliest {
                Some(earliest) => earliest.min(lot.acquired_at),
                None => lot.acquired_at,
            });
            consumed.synthetic |= lot.synthetic;
            consumed.shares.push(share);

            lot.qty_remaining -= take;
            remaining -= take;
            if lot.qty_remaining.is_zero() {
                queue.pop_front();
            }
        }

        if remaining > Decimal::ZERO {
            // The reconciler should have prevented this; cover the deficit
            // with a zero-basis lot so downstream accounting stays closed.
            log::warn!(
                "lot queue exhausted for {asset}: short {remaining} on tx {}",
                tx.id
            );
            out.audits.push(AuditEntry::new(
                tx.instant,
                AuditCategory::Diagnostic,
                Some(tx.id.clone()),
                format!("lot queue exhausted for {asset}; zero-basis deficit {remaining}"),
            ));
            consumed.shares.push(LotShare {
                source_tx_id: format!("{}-deficit", tx.id),
                acquired_at: tx.instant,
                qty: remaining,
                basis_eur: Decimal::ZERO,
            });
            consumed.earliest = Some(match consumed.earliest {
                Some(earliest) => earliest.min(tx.instant),
                None => tx.instant,
            });
            consumed.synthetic = true;
            // The defensive lot is an implied deposit; mirror it in the
            // balance so the lot-sum check stays closed.
            *self.balances.entry(asset.clone()).or_default() += remaining;
        }

        consumed
    }

    /// Consume lots and emit the capital disposal, returning whether any
    /// synthetic ancestry was touched. `proceeds` of `None` means the oracle
    /// had no price: lots are still consumed so the ledger stays closed, but
    /// no event is emitted and the run is marked non-final.
    fn dispose(
        &mut self,
        tx: &Tx,
        asset: &Asset,
        qty: Decimal,
        proceeds: Option<Decimal>,
        out: &mut TaxComputation,
    ) -> bool {
        let consumed = self.consume(tx, asset, qty, out);
        let synthetic = tx.synthetic || consumed.synthetic;
        let proceeds = match proceeds {
            Some(proceeds) => proceeds,
            None => {
                out.audits.push(AuditEntry::new(
                    tx.instant,
                    AuditCategory::Diagnostic,
                    Some(tx.id.clone()),
                    format!("DisposalNeedsPrice: {qty} {asset} disposed without EUR valuation"),
                ));
                out.needs_price = true;
                return synthetic;
            }
        };

        let holding = match consumed.earliest {
            Some(earliest)
                if earliest
                    .checked_add_months(Months::new(12))
                    .map(|cutoff| tx.instant > cutoff)
                    .unwrap_or(false) =>
            {
                Holding::Long
            }
            _ => Holding::Short,
        };

        out.events.push(TaxEvent {
            kind: TaxEventKind::CapitalDisposal {
                asset: asset.clone(),
                qty,
                proceeds_eur: proceeds,
                cost_basis_eur: consumed.basis,
                gain_eur: proceeds - consumed.basis,
                holding,
                lots_consumed: consumed.shares,
            },
            tax_year: tax_year(tx.instant),
            instant: tx.instant,
            source_tx_id: tx.id.clone(),
            synthetic_inputs: synthetic,
        });
        synthetic
    }

    fn push_lot(
        &mut self,
        tx: &Tx,
        asset: &Asset,
        qty: Decimal,
        unit_basis_eur: Decimal,
        synthetic: bool,
    ) {
        if !tracked(asset) || qty <= Decimal::ZERO {
            return;
        }
        log::debug!(
            "lot {} {} @ {} EUR/unit from tx {}",
            qty,
            asset,
            unit_basis_eur,
            tx.id
        );
        self.queues.entry(asset.clone()).or_default().push_back(Lot {
            asset: asset.clone(),
            qty_remaining: qty,
            acquired_at: tx.instant,
            unit_basis_eur,
            source_tx_id: tx.id.clone(),
            synthetic,
        });
    }

    /// EUR unit price at the transaction instant, auditing fallbacks and
    /// recording missing prices as diagnostics.
    fn unit_price(
        &mut self,
        asset: &Asset,
        tx: &Tx,
        oracle: &mut PriceOracle,
        out: &mut TaxComputation,
    ) -> Option<Decimal> {
        match oracle.price_eur(asset, tx.instant) {
            Ok(quotation) => {
                if quotation.fallback_days > 0 {
                    out.audits.push(AuditEntry::new(
                        tx.instant,
                        AuditCategory::PriceFallback,
                        Some(tx.id.clone()),
                        format!(
                            "price_fallback_days={} for {asset} ({})",
                            quotation.fallback_days, quotation.source_tag
                        ),
                    ));
                }
                Some(quotation.price)
            }
            Err(PriceError::MissingPrice { .. }) => {
                out.audits.push(AuditEntry::new(
                    tx.instant,
                    AuditCategory::Diagnostic,
                    Some(tx.id.clone()),
                    format!("no EUR price for {asset} at {}", tx.instant.to_rfc3339()),
                ));
                out.needs_price = true;
                None
            }
            Err(err) => {
                log::warn!("oracle failure for {asset}: {err}");
                out.needs_price = true;
                None
            }
        }
    }

    fn value_eur(
        &mut self,
        asset: &Asset,
        qty: Decimal,
        tx: &Tx,
        oracle: &mut PriceOracle,
        out: &mut TaxComputation,
    ) -> Option<Decimal> {
        if asset.is_eur() {
            return Some(qty);
        }
        self.unit_price(asset, tx, oracle, out).map(|price| qty * price)
    }

    fn is_internal_transfer(&self, tx: &Tx) -> bool {
        let marker = |s: &Option<String>| {
            s.as_deref()
                .map(|s| s.to_lowercase().contains("transfer"))
                .unwrap_or(false)
        };
        marker(&tx.group) || marker(&tx.comment)
    }

    fn apply_balance_deltas(&mut self, tx: &Tx) {
        for (asset, delta) in deltas(tx) {
            if tracked(&asset) {
                *self.balances.entry(asset).or_default() += delta;
            }
        }
    }

    /// Lot-sum must track the reconciled balance for every asset the
    /// transaction touched. Parked transfer lots are outside both the queue
    /// and the balance, so no adjustment is needed for them.
    fn check_lot_sums(&self, tx: &Tx) -> Result<(), FifoError> {
        let tolerance = negative_tolerance();
        for (asset, _) in deltas(tx) {
            if !tracked(&asset) {
                continue;
            }
            let balance = self.balances.get(&asset).copied().unwrap_or(Decimal::ZERO);
            let lot_sum: Decimal = self
                .queues
                .get(&asset)
                .map(|queue| queue.iter().map(|lot| lot.qty_remaining).sum())
                .unwrap_or(Decimal::ZERO);
            if (lot_sum - balance).abs() > tolerance {
                return Err(FifoError::Invariant(format!(
                    "after tx {}: lot sum {lot_sum} != balance {balance} for {asset}",
                    tx.id
                )));
            }
        }
        Ok(())
    }
}

fn tracked(asset: &Asset) -> bool {
    !asset.is_eur()
}

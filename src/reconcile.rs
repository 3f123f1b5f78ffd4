use crate::assets::Asset;
use crate::snapshot::BalanceSnapshot;
use crate::tax::events::{AuditCategory, AuditEntry};
use crate::transaction::{sort_stream, Leg, Tx, TxKind};
use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Internal invariant violation; carries a dump of the offending state.
    #[error("reconciliation invariant violated: {0}")]
    Fatal(String),
    #[error("snapshot as_of {as_of} is earlier than the last transaction at {last_tx}")]
    SnapshotBeforeLastTx { as_of: String, last_tx: String },
}

/// Output of a reconciliation pass: the repaired stream, the audit trail of
/// every action taken, and the closing balances.
#[derive(Debug)]
pub struct Reconciliation {
    pub txs: Vec<Tx>,
    pub audits: Vec<AuditEntry>,
    pub balances: HashMap<Asset, Decimal>,
}

/// Negative-balance detection threshold, absorbing decimal rounding noise.
pub fn negative_tolerance() -> Decimal {
    Decimal::new(1, 12)
}

/// Net per-asset quantity change implied by a transaction's legs, in leg
/// order (in, out, fee) with duplicate assets merged.
pub fn deltas(tx: &Tx) -> Vec<(Asset, Decimal)> {
    let mut out: Vec<(Asset, Decimal)> = Vec::new();
    let mut push = |leg: &Option<Leg>, sign: Decimal| {
        if let Some(leg) = leg {
            let amount = leg.amount * sign;
            match out.iter_mut().find(|(asset, _)| *asset == leg.asset) {
                Some((_, total)) => *total += amount,
                None => out.push((leg.asset.clone(), amount)),
            }
        }
    };
    push(&tx.in_leg, Decimal::ONE);
    push(&tx.out_leg, Decimal::NEGATIVE_ONE);
    push(&tx.fee_leg, Decimal::NEGATIVE_ONE);
    out
}

/// Walks the time-sorted stream keeping per-asset balances, inserting
/// synthetic balancing deposits wherever history would otherwise go
/// negative, and finally consolidating against the user's balance snapshot.
/// Never fails on a negative balance; it always repairs.
pub struct Reconciler {
    tolerance: Decimal,
}

impl Reconciler {
    pub fn new(tolerance: Decimal) -> Reconciler {
        Reconciler { tolerance }
    }

    pub fn reconcile(
        &self,
        txs: Vec<Tx>,
        snapshot: Option<&BalanceSnapshot>,
    ) -> Result<Reconciliation, ReconcileError> {
        let mut txs = txs;
        sort_stream(&mut txs);

        if let (Some(snapshot), Some(last)) = (snapshot, txs.last()) {
            if snapshot.as_of < last.instant {
                return Err(ReconcileError::SnapshotBeforeLastTx {
                    as_of: snapshot.as_of.to_rfc3339(),
                    last_tx: last.instant.to_rfc3339(),
                });
            }
        }

        let neg_tolerance = negative_tolerance();
        let mut balances: HashMap<Asset, Decimal> = HashMap::new();
        let mut output: Vec<Tx> = Vec::with_capacity(txs.len());
        let mut audits: Vec<AuditEntry> = Vec::new();
        let mut max_ordinal = txs.iter().map(|t| t.ordinal).max().unwrap_or(0);

        for tx in txs {
            for (asset, delta) in deltas(&tx) {
                let balance = balances.get(&asset).copied().unwrap_or(Decimal::ZERO);
                let after = balance + delta;
                if after < -neg_tolerance {
                    let deficit = -after;
                    let repair = balancing_deposit(&tx, &asset, deficit);
                    log::warn!(
                        "inserting synthetic deposit of {deficit} {asset} before tx {}",
                        tx.id
                    );
                    audits.push(AuditEntry::new(
                        repair.instant,
                        AuditCategory::SyntheticInserted,
                        Some(tx.id.clone()),
                        format!("balance_repair {deficit} {asset} before tx {}", tx.id),
                    ));
                    *balances.entry(asset.clone()).or_default() += deficit;
                    output.push(repair);
                }
            }

            for (asset, delta) in deltas(&tx) {
                *balances.entry(asset).or_default() += delta;
            }
            output.push(tx);

            // A repair always lifts the post-delta balance to exactly zero;
            // anything below tolerance after that is a bug, not bad input.
            if let Some((asset, balance)) = balances
                .iter()
                .find(|(_, balance)| **balance < -neg_tolerance)
            {
                return Err(ReconcileError::Fatal(format!(
                    "negative balance after repair: {} {} (all balances: {})",
                    balance,
                    asset,
                    dump_balances(&balances)
                )));
            }
        }

        if let Some(snapshot) = snapshot {
            self.consolidate(snapshot, &mut balances, &mut output, &mut audits, &mut max_ordinal);
        }

        Ok(Reconciliation {
            txs: output,
            audits,
            balances,
        })
    }

    /// Emit consolidation deposits/withdrawals driving each asset's balance
    /// to the user-declared amount at the snapshot instant.
    fn consolidate(
        &self,
        snapshot: &BalanceSnapshot,
        balances: &mut HashMap<Asset, Decimal>,
        output: &mut Vec<Tx>,
        audits: &mut Vec<AuditEntry>,
        max_ordinal: &mut usize,
    ) {
        let mut assets: Vec<Asset> = balances
            .keys()
            .chain(snapshot.balances.keys())
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        assets.dedup();

        // Deposits first so same-instant FIFO consumption stays deterministic
        let mut adjustments: Vec<(Asset, Decimal)> = Vec::new();
        for asset in assets {
            let current = balances.get(&asset).copied().unwrap_or(Decimal::ZERO);
            let target = snapshot.balance(&asset);
            let diff = target - current;
            if diff == Decimal::ZERO {
                continue;
            }
            if diff.abs() <= self.tolerance {
                audits.push(AuditEntry::new(
                    snapshot.as_of,
                    AuditCategory::ToleranceDrop,
                    None,
                    format!(
                        "consolidation diff {diff} {asset} within tolerance {}, dropped",
                        self.tolerance
                    ),
                ));
                continue;
            }
            adjustments.push((asset, diff));
        }
        adjustments.sort_by_key(|(_, diff)| *diff < Decimal::ZERO);

        for (asset, diff) in adjustments {
            let current = balances.get(&asset).copied().unwrap_or(Decimal::ZERO);
            let target = current + diff;
            *max_ordinal += 1;
            let tx = consolidation_tx(snapshot, &asset, current, diff, *max_ordinal);
            audits.push(AuditEntry::new(
                snapshot.as_of,
                AuditCategory::SyntheticInserted,
                Some(tx.id.clone()),
                format!(
                    "consolidation {} {} {}: balance {current} -> {target} per user snapshot",
                    if diff > Decimal::ZERO {
                        "deposit"
                    } else {
                        "withdrawal"
                    },
                    diff.abs(),
                    asset
                ),
            ));
            *balances.entry(asset).or_default() += diff;
            output.push(tx);
        }
    }
}

fn balancing_deposit(tx: &Tx, asset: &Asset, deficit: Decimal) -> Tx {
    Tx {
        id: format!("syn-balance-{}-{}", tx.id, asset.symbol()),
        // One microsecond before the repaired transaction preserves order
        // without colliding with it.
        instant: tx.instant - Duration::microseconds(1),
        kind: TxKind::SyntheticBalancingDeposit,
        in_leg: Some(Leg::new(asset.clone(), deficit)),
        out_leg: None,
        fee_leg: None,
        venue: tx.venue.clone(),
        group: None,
        comment: None,
        synthetic: true,
        origin_note: Some(format!(
            "balance_repair for tx {}, deficit {deficit}",
            tx.id
        )),
        ordinal: tx.ordinal,
    }
}

fn consolidation_tx(
    snapshot: &BalanceSnapshot,
    asset: &Asset,
    current: Decimal,
    diff: Decimal,
    ordinal: usize,
) -> Tx {
    let (in_leg, out_leg) = if diff > Decimal::ZERO {
        (Some(Leg::new(asset.clone(), diff)), None)
    } else {
        (None, Some(Leg::new(asset.clone(), diff.abs())))
    };
    Tx {
        id: format!("syn-consolidation-{}", asset.symbol()),
        instant: snapshot.as_of,
        kind: TxKind::SyntheticConsolidation,
        in_leg,
        out_leg,
        fee_leg: None,
        venue: String::new(),
        group: None,
        comment: None,
        synthetic: true,
        origin_note: Some(format!(
            "final consolidation of {asset}: balance {current} -> {} per user snapshot at {}",
            current + diff,
            snapshot.as_of.to_rfc3339()
        )),
        ordinal,
    }
}

fn dump_balances(balances: &HashMap<Asset, Decimal>) -> String {
    let mut entries: Vec<String> = balances
        .iter()
        .map(|(asset, balance)| format!("{asset}={balance}"))
        .collect();
    entries.sort();
    entries.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn tx(id: &str, instant: &str, kind: TxKind, ordinal: usize) -> Tx {
        Tx {
            id: id.to_string(),
            instant: ts(instant),
            kind,
            in_leg: None,
            out_leg: None,
            fee_leg: None,
            venue: "kraken".to_string(),
            group: None,
            comment: None,
            synthetic: false,
            origin_note: None,
            ordinal,
        }
    }

    fn deposit(id: &str, instant: &str, asset: &str, amount: Decimal, ordinal: usize) -> Tx {
        let mut t = tx(id, instant, TxKind::Deposit, ordinal);
        t.in_leg = Some(Leg::new(Asset::new(asset), amount));
        t
    }

    fn withdrawal(id: &str, instant: &str, asset: &str, amount: Decimal, ordinal: usize) -> Tx {
        let mut t = tx(id, instant, TxKind::Withdrawal, ordinal);
        t.out_leg = Some(Leg::new(Asset::new(asset), amount));
        t
    }

    fn snapshot(as_of: &str, entries: &[(&str, Decimal)]) -> BalanceSnapshot {
        BalanceSnapshot {
            as_of: ts(as_of),
            balances: entries
                .iter()
                .map(|(symbol, amount)| (Asset::new(symbol), *amount))
                .collect(),
        }
    }

    #[test]
    fn balanced_history_passes_through_unchanged() {
        let txs = vec![
            deposit("t1", "2022-01-01 10:00:00", "BTC", dec!(1), 1),
            withdrawal("t2", "2022-06-01 10:00:00", "BTC", dec!(0.4), 2),
        ];
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, None)
            .unwrap();
        assert_eq!(result.txs.len(), 2);
        assert!(result.audits.is_empty());
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0.6));
    }

    #[test]
    fn negative_balance_inserts_synthetic_deposit() {
        let txs = vec![withdrawal("t1", "2022-05-10 00:00:00", "BTC", dec!(0.5), 1)];
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, None)
            .unwrap();

        assert_eq!(result.txs.len(), 2);
        let repair = &result.txs[0];
        assert_eq!(repair.kind, TxKind::SyntheticBalancingDeposit);
        assert!(repair.synthetic);
        assert_eq!(repair.in_leg.as_ref().unwrap().amount, dec!(0.5));
        assert_eq!(
            repair.instant,
            ts("2022-05-10 00:00:00") - Duration::microseconds(1)
        );
        assert_eq!(
            repair.origin_note.as_deref(),
            Some("balance_repair for tx t1, deficit 0.5")
        );
        assert!(repair.validate().is_ok());

        assert_eq!(result.audits.len(), 1);
        assert_eq!(result.audits[0].category, AuditCategory::SyntheticInserted);
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0));
    }

    #[test]
    fn partial_deficit_only_repairs_the_gap() {
        let txs = vec![
            deposit("t1", "2022-01-01 00:00:00", "BTC", dec!(0.3), 1),
            withdrawal("t2", "2022-05-10 00:00:00", "BTC", dec!(0.5), 2),
        ];
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, None)
            .unwrap();

        assert_eq!(result.txs.len(), 3);
        let repair = &result.txs[1];
        assert_eq!(repair.kind, TxKind::SyntheticBalancingDeposit);
        assert_eq!(repair.in_leg.as_ref().unwrap().amount, dec!(0.2));
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0));
    }

    #[test]
    fn fee_leg_counts_toward_the_deficit() {
        let mut t = withdrawal("t1", "2022-05-10 00:00:00", "BTC", dec!(0.5), 1);
        t.fee_leg = Some(Leg::new(Asset::new("BTC"), dec!(0.01)));
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(vec![t], None)
            .unwrap();
        let repair = &result.txs[0];
        assert_eq!(repair.in_leg.as_ref().unwrap().amount, dec!(0.51));
    }

    #[test]
    fn consolidation_emits_withdrawal_for_surplus() {
        let txs = vec![deposit("t1", "2023-01-01 00:00:00", "BTC", dec!(0.3), 1)];
        let snap = snapshot("2023-12-31 00:00:00", &[("BTC", dec!(0.25))]);
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, Some(&snap))
            .unwrap();

        let consolidation = result.txs.last().unwrap();
        assert_eq!(consolidation.kind, TxKind::SyntheticConsolidation);
        assert_eq!(consolidation.out_leg.as_ref().unwrap().amount, dec!(0.05));
        assert_eq!(consolidation.instant, ts("2023-12-31 00:00:00"));
        assert!(consolidation.validate().is_ok());
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0.25));
    }

    #[test]
    fn consolidation_emits_deposit_for_shortfall() {
        let txs = vec![deposit("t1", "2023-01-01 00:00:00", "BTC", dec!(0.2), 1)];
        let snap = snapshot("2023-12-31 00:00:00", &[("BTC", dec!(0.5))]);
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, Some(&snap))
            .unwrap();

        let consolidation = result.txs.last().unwrap();
        assert_eq!(consolidation.in_leg.as_ref().unwrap().amount, dec!(0.3));
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0.5));
    }

    #[test]
    fn sub_tolerance_diff_is_dropped_with_audit() {
        let txs = vec![deposit("t1", "2023-01-01 00:00:00", "BTC", dec!(0.300000001), 1)];
        let snap = snapshot("2023-12-31 00:00:00", &[("BTC", dec!(0.3))]);
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, Some(&snap))
            .unwrap();

        assert_eq!(result.txs.len(), 1);
        assert_eq!(result.audits.len(), 1);
        assert_eq!(result.audits[0].category, AuditCategory::ToleranceDrop);
    }

    #[test]
    fn missing_snapshot_asset_means_zero_target() {
        let txs = vec![deposit("t1", "2023-01-01 00:00:00", "ETH", dec!(2), 1)];
        let snap = snapshot("2023-12-31 00:00:00", &[("BTC", dec!(0.1))]);
        let result = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, Some(&snap))
            .unwrap();

        // ETH drained to zero, BTC topped up to 0.1; deposits sort first
        let kinds: Vec<(bool, &str)> = result.txs[1..]
            .iter()
            .map(|t| {
                (
                    t.in_leg.is_some(),
                    t.in_leg
                        .as_ref()
                        .or(t.out_leg.as_ref())
                        .unwrap()
                        .asset
                        .symbol(),
                )
            })
            .collect();
        assert_eq!(kinds, vec![(true, "BTC"), (false, "ETH")]);
        assert_eq!(result.balances[&Asset::new("ETH")], dec!(0));
        assert_eq!(result.balances[&Asset::new("BTC")], dec!(0.1));
    }

    #[test]
    fn snapshot_before_last_tx_is_rejected() {
        let txs = vec![deposit("t1", "2023-06-01 00:00:00", "BTC", dec!(1), 1)];
        let snap = snapshot("2023-01-01 00:00:00", &[("BTC", dec!(1))]);
        let err = Reconciler::new(dec!(0.00000001))
            .reconcile(txs, Some(&snap))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SnapshotBeforeLastTx { .. }));
    }

    #[test]
    fn trade_deltas_touch_both_assets() {
        let mut t = tx("t1", "2023-03-01 00:00:00", TxKind::Trade, 1);
        t.in_leg = Some(Leg::new(Asset::new("BTC"), dec!(0.08)));
        t.out_leg = Some(Leg::new(Asset::new("ETH"), dec!(2)));
        let d = deltas(&t);
        assert_eq!(
            d,
            vec![
                (Asset::new("BTC"), dec!(0.08)),
                (Asset::new("ETH"), dec!(-2)),
            ]
        );
    }
}

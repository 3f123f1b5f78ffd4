use crate::assets::Asset;
use crate::config::Config;
use crate::error::QntropyError;
use crate::importers::CointrackingImporter;
use crate::prices::PriceOracle;
use crate::reconcile::Reconciler;
use crate::sink::EventSink;
use crate::snapshot::BalanceSnapshot;
use crate::tax::fifo::FifoEngine;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;

/// Everything a full run produces: the event sink (tax events + the merged
/// audit trail in pipeline order), the closing balances, and whether any
/// valuation is still missing (the run must not be treated as final then).
pub struct PipelineOutput {
    pub sink: EventSink,
    pub balances: HashMap<Asset, Decimal>,
    pub needs_price: bool,
}

/// Run the whole core: normalize, reconcile, prewarm the oracle, feed the
/// FIFO engine, and collect everything into the sink. Deterministic for a
/// pinned cache and provider fixture.
pub fn run<R: Read>(
    config: &Config,
    input: R,
    source_name: &str,
    snapshot: Option<&BalanceSnapshot>,
    oracle: &mut PriceOracle,
) -> Result<PipelineOutput, QntropyError> {
    let importer = CointrackingImporter::new(config);
    let import = importer.import(input, source_name)?;

    let reconciler = Reconciler::new(config.tolerance);
    let reconciliation = reconciler.reconcile(import.txs, snapshot)?;

    oracle.prewarm(distinct_asset_days(&reconciliation.txs));

    let mut engine = FifoEngine::new(config);
    let computation = engine.process(&reconciliation.txs, oracle)?;
    oracle.commit();

    let mut sink = EventSink::new();
    sink.extend_audits(import.audits);
    sink.extend_audits(reconciliation.audits);
    sink.extend_audits(computation.audits);
    sink.extend_events(computation.events);

    Ok(PipelineOutput {
        sink,
        balances: reconciliation.balances,
        needs_price: computation.needs_price,
    })
}

/// The distinct `(asset, day)` pairs a stream will need valuations for,
/// in deterministic order.
fn distinct_asset_days(txs: &[crate::transaction::Tx]) -> Vec<(Asset, NaiveDate)> {
    let mut days: BTreeSet<(String, NaiveDate)> = BTreeSet::new();
    let mut assets: HashMap<String, Asset> = HashMap::new();
    for tx in txs {
        for leg in [&tx.in_leg, &tx.out_leg, &tx.fee_leg].into_iter().flatten() {
            if leg.asset.is_eur() {
                continue;
            }
            days.insert((leg.asset.symbol().to_string(), tx.instant.date_naive()));
            assets
                .entry(leg.asset.symbol().to_string())
                .or_insert_with(|| leg.asset.clone());
        }
    }
    days.into_iter()
        .map(|(symbol, day)| (assets[&symbol].clone(), day))
        .collect()
}

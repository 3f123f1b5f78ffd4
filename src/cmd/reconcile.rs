//! Reconcile command - balance walk with synthetic repairs, no tax math

use crate::cmd::{load_snapshot, CommonOpts};
use crate::importers::CointrackingImporter;
use crate::reconcile::Reconciler;
use clap::Args;
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ReconcileCommand {
    #[command(flatten)]
    common: CommonOpts,

    /// Final balance snapshot CSV ('asset,amount' with '# as_of=' header)
    #[arg(short, long)]
    snapshot: Option<PathBuf>,
}

impl ReconcileCommand {
    pub fn exec(&self) -> color_eyre::Result<()> {
        let config = self.common.config()?;
        let importer = CointrackingImporter::new(&config);
        let import = importer
            .import(self.common.open_input()?, &self.common.source_name())
            .map_err(crate::error::QntropyError::from)?;
        let snapshot = load_snapshot(self.snapshot.as_deref())?;

        let reconciler = Reconciler::new(config.tolerance);
        let result = reconciler
            .reconcile(import.txs, snapshot.as_ref())
            .map_err(crate::error::QntropyError::from)?;

        let synthetic = result.txs.iter().filter(|t| t.synthetic).count();
        println!();
        println!("RECONCILIATION");
        println!();
        println!(
            "  {} transactions ({} synthetic inserted, {} rows skipped)",
            result.txs.len(),
            synthetic,
            import.audits.len()
        );
        println!();
        println!("  Closing balances:");

        let mut balances: Vec<_> = result
            .balances
            .iter()
            .filter(|(_, balance)| **balance != Decimal::ZERO)
            .collect();
        balances.sort_by(|a, b| a.0.symbol().cmp(b.0.symbol()));
        for (asset, balance) in balances {
            println!("    {:<8} {}", asset.symbol(), balance);
        }
        if !result.audits.is_empty() {
            println!();
            println!("  Audit trail:");
            for audit in &result.audits {
                println!("    [{}] {}", audit.category.display(), audit.reason);
            }
        }
        println!();
        Ok(())
    }
}

//! Compute command - the full pipeline, committed to the output directory

use crate::cmd::{load_snapshot, CommonOpts};
use crate::config::ProviderKind;
use crate::error::EXIT_MISSING_PRICE;
use crate::pipeline;
use crate::prices::{CoingeckoProvider, PriceCache, PriceOracle, QuoteProvider};
use crate::tax::events::TaxEventKind;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ComputeCommand {
    #[command(flatten)]
    common: CommonOpts,

    /// Final balance snapshot CSV ('asset,amount' with '# as_of=' header)
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Output directory for events.csv and audit.csv
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Keep only events of this tax year in the output
    #[arg(short, long)]
    year: Option<i32>,
}

impl ComputeCommand {
    pub fn exec(&self) -> color_eyre::Result<()> {
        let config = self.common.config()?;
        let snapshot = load_snapshot(self.snapshot.as_deref())?;

        let cache = PriceCache::open(&config.price_cache_dir)
            .map_err(|e| crate::error::QntropyError::Price(e.into()))?;
        let providers: Vec<Box<dyn QuoteProvider>> = match config.provider {
            ProviderKind::Coingecko => vec![Box::new(CoingeckoProvider::new(
                config.provider_timeout_secs,
                config.api_key.clone(),
            ))],
            ProviderKind::None => vec![],
        };
        let mut oracle = PriceOracle::new(cache, providers);

        let output = pipeline::run(
            &config,
            self.common.open_input()?,
            &self.common.source_name(),
            snapshot.as_ref(),
            &mut oracle,
        )?;

        let sink = match self.year {
            Some(year) => {
                let mut filtered = crate::sink::EventSink::new();
                filtered.extend_events(
                    output
                        .sink
                        .events()
                        .iter()
                        .filter(|e| e.tax_year == year)
                        .cloned(),
                );
                filtered.extend_audits(output.sink.audits().iter().cloned());
                filtered
            }
            None => output.sink,
        };

        let (events_path, audit_path) = sink.commit(&self.out)?;

        let disposals = sink
            .events()
            .iter()
            .filter(|e| matches!(e.kind, TaxEventKind::CapitalDisposal { .. }))
            .count();
        let income = sink.events().len() - disposals;
        println!(
            "Computed {} disposals and {} income events -> {}",
            disposals,
            income,
            events_path.display()
        );
        println!(
            "{} audit entries -> {}",
            sink.audits().len(),
            audit_path.display()
        );

        if output.needs_price {
            eprintln!(
                "Warning: some events are missing EUR valuations beyond the fallback window; \
                 this run is not final. See the audit trail."
            );
            std::process::exit(EXIT_MISSING_PRICE);
        }
        Ok(())
    }
}

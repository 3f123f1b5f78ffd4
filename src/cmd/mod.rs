pub mod compute;
pub mod import;
pub mod reconcile;
pub mod report;

use crate::config::{Config, TransferMatching};
use crate::snapshot::{read_snapshot, BalanceSnapshot};
use chrono_tz::Tz;
use clap::Args;
use color_eyre::eyre::{self, WrapErr};
use rust_decimal::Decimal;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Flags shared by every pipeline-driving subcommand
#[derive(Args, Debug)]
pub struct CommonOpts {
    /// Cointracking trade-table full CSV export
    #[arg(short, long)]
    pub input: PathBuf,

    /// IANA timezone the source timestamps are expressed in
    #[arg(long, default_value = "Europe/Madrid")]
    pub tz: String,

    /// Absolute tolerance (asset units) for final-balance consolidation
    #[arg(long, default_value = "0.00000001")]
    pub tolerance: Decimal,

    /// Skip rows with unknown type strings instead of failing the run
    #[arg(long)]
    pub skip_unknown: bool,

    /// Match internal transfers within a 24h / 0.5% window and carry basis
    #[arg(long)]
    pub match_transfers: bool,

    /// Recognise airdrops as income at fair market value
    #[arg(long)]
    pub airdrops_as_income: bool,
}

impl CommonOpts {
    /// Build the run configuration: defaults, then these flags, then the
    /// `QNTROPY_*` environment.
    pub fn config(&self) -> eyre::Result<Config> {
        let tz: Tz = self
            .tz
            .parse()
            .map_err(|e| eyre::eyre!("invalid --tz '{}': {e}", self.tz))?;
        let mut config = Config::default();
        config.tz = tz;
        config.tolerance = self.tolerance;
        config.skip_unknown = self.skip_unknown;
        if self.match_transfers {
            config.transfer_matching = TransferMatching::default_window();
        }
        config.airdrops_as_income = self.airdrops_as_income;
        Ok(config.apply_env())
    }

    pub fn open_input(&self) -> eyre::Result<File> {
        File::open(&self.input)
            .wrap_err_with(|| format!("cannot open input {}", self.input.display()))
    }

    /// Transaction ids are seeded from the input file stem
    pub fn source_name(&self) -> String {
        self.input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("input")
            .to_string()
    }
}

pub fn load_snapshot(path: Option<&Path>) -> eyre::Result<Option<BalanceSnapshot>> {
    let path = match path {
        Some(path) => path,
        None => return Ok(None),
    };
    let file =
        File::open(path).wrap_err_with(|| format!("cannot open snapshot {}", path.display()))?;
    let snapshot = read_snapshot(file).map_err(crate::error::QntropyError::from)?;
    Ok(Some(snapshot))
}

//! Import command - normalize a source export into the canonical stream

use crate::cmd::CommonOpts;
use crate::importers::CointrackingImporter;
use clap::Args;
use std::io::Write;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ImportCommand {
    #[command(flatten)]
    common: CommonOpts,

    /// Write the canonical transactions (JSON) here instead of stdout
    #[arg(short, long)]
    out: Option<PathBuf>,
}

impl ImportCommand {
    pub fn exec(&self) -> color_eyre::Result<()> {
        let config = self.common.config()?;
        let importer = CointrackingImporter::new(&config);
        let import = importer
            .import(self.common.open_input()?, &self.common.source_name())
            .map_err(crate::error::QntropyError::from)?;

        for audit in &import.audits {
            log::warn!("{}", audit.reason);
        }

        let json = serde_json::to_string_pretty(&import.txs)?;
        match &self.out {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)?;
                println!(
                    "Imported {} transactions ({} rows skipped) -> {}",
                    import.txs.len(),
                    import.audits.len(),
                    path.display()
                );
            }
            None => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                handle.write_all(json.as_bytes())?;
                handle.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

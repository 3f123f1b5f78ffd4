use clap::{Parser, Subcommand};
use qntropy::cmd::{
    compute::ComputeCommand, import::ImportCommand, reconcile::ReconcileCommand,
    report::ReportCommand,
};
use qntropy::error::QntropyError;

#[derive(Parser, Debug)]
#[command(
    name = "qntropy",
    version,
    about = "Crypto tax figures for Spanish IRPF: FIFO cost basis in EUR"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalize a source CSV export into canonical transactions
    Import(ImportCommand),
    /// Reconcile balances and show the repairs the pipeline would make
    Reconcile(ReconcileCommand),
    /// Run the full pipeline and write events.csv / audit.csv
    Compute(ComputeCommand),
    /// Summarize per-year totals from a computed events file
    Report(ReportCommand),
}

impl Cli {
    fn run(&self) -> color_eyre::Result<()> {
        match &self.command {
            Command::Import(cmd) => cmd.exec(),
            Command::Reconcile(cmd) => cmd.exec(),
            Command::Compute(cmd) => cmd.exec(),
            Command::Report(cmd) => cmd.exec(),
        }
    }
}

fn main() {
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporting: {err}");
    }
    env_logger::init();

    let cli = Cli::parse();
    if let Err(report) = cli.run() {
        let code = report
            .downcast_ref::<QntropyError>()
            .map(QntropyError::exit_code)
            .unwrap_or(1);
        eprintln!("Error: {report:#}");
        std::process::exit(code);
    }
}

//! Report command - per-year totals over an already-computed events file

use crate::sink::{read_events_csv, EventRow};
use crate::tax::events::round_eur;
use clap::Args;
use color_eyre::eyre::WrapErr;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ReportCommand {
    /// events.csv produced by the compute command
    #[arg(short, long)]
    events: PathBuf,

    /// Tax year to report (all years when omitted)
    #[arg(short, long)]
    year: Option<i32>,

    /// Output as JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct YearTotals {
    disposals: usize,
    proceeds_eur: Decimal,
    cost_basis_eur: Decimal,
    gain_eur: Decimal,
    movable_capital_income_eur: Decimal,
    other_income_eur: Decimal,
    synthetic_inputs: usize,
}

impl ReportCommand {
    pub fn exec(&self) -> color_eyre::Result<()> {
        let file = File::open(&self.events)
            .wrap_err_with(|| format!("cannot open events {}", self.events.display()))?;
        let rows = read_events_csv(file)?;

        let mut years: BTreeMap<i32, YearTotals> = BTreeMap::new();
        for row in &rows {
            if self.year.is_some_and(|y| y != row.tax_year) {
                continue;
            }
            let totals = years.entry(row.tax_year).or_default();
            accumulate(totals, row);
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&years)?);
            return Ok(());
        }

        println!();
        match self.year {
            Some(year) => println!("TAX REPORT ({year})"),
            None => println!("TAX REPORT (all years)"),
        }
        println!();
        if years.is_empty() {
            println!("  No events.");
            return Ok(());
        }
        for (year, totals) in &years {
            println!("  {year}");
            println!("    Disposals:              {}", totals.disposals);
            println!(
                "    Proceeds:               {} EUR",
                round_eur(totals.proceeds_eur)
            );
            println!(
                "    Cost basis:             {} EUR",
                round_eur(totals.cost_basis_eur)
            );
            println!(
                "    Gain/loss:              {} EUR",
                round_eur(totals.gain_eur)
            );
            println!(
                "    Movable-capital income: {} EUR",
                round_eur(totals.movable_capital_income_eur)
            );
            println!(
                "    Other income:           {} EUR",
                round_eur(totals.other_income_eur)
            );
            if totals.synthetic_inputs > 0 {
                println!(
                    "    Events with synthetic inputs: {} (review the audit trail)",
                    totals.synthetic_inputs
                );
            }
            println!();
        }
        Ok(())
    }
}

fn accumulate(totals: &mut YearTotals, row: &EventRow) {
    if row.synthetic_inputs {
        totals.synthetic_inputs += 1;
    }
    match row.kind.as_str() {
        "CapitalDisposal" => {
            totals.disposals += 1;
            totals.proceeds_eur += row.proceeds_eur;
            totals.cost_basis_eur += row.cost_basis_eur.unwrap_or(Decimal::ZERO);
            totals.gain_eur += row.gain_eur.unwrap_or(Decimal::ZERO);
        }
        "Income" => match row.income_category.as_deref() {
            Some("MovableCapital") => totals.movable_capital_income_eur += row.proceeds_eur,
            _ => totals.other_income_eur += row.proceeds_eur,
        },
        other => log::warn!("ignoring unknown event kind '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn disposal_row(year: i32, proceeds: Decimal, basis: Decimal) -> EventRow {
        EventRow {
            tax_year: year,
            kind: "CapitalDisposal".to_string(),
            instant_utc: "2023-06-01T10:00:00+00:00".to_string(),
            asset: "BTC".to_string(),
            qty: dec!(1),
            proceeds_eur: proceeds,
            cost_basis_eur: Some(basis),
            gain_eur: Some(proceeds - basis),
            holding: Some("Short".to_string()),
            income_category: None,
            source_tx_id: "t1".to_string(),
            synthetic_inputs: false,
            lots_consumed_json: "[]".to_string(),
        }
    }

    #[test]
    fn totals_accumulate_by_kind() {
        let mut totals = YearTotals::default();
        accumulate(&mut totals, &disposal_row(2023, dec!(100), dec!(40)));
        accumulate(&mut totals, &disposal_row(2023, dec!(50), dec!(10)));

        let mut income = disposal_row(2023, dec!(4), dec!(0));
        income.kind = "Income".to_string();
        income.cost_basis_eur = None;
        income.gain_eur = None;
        income.income_category = Some("MovableCapital".to_string());
        accumulate(&mut totals, &income);

        assert_eq!(totals.disposals, 2);
        assert_eq!(totals.proceeds_eur, dec!(150));
        assert_eq!(totals.gain_eur, dec!(100));
        assert_eq!(totals.movable_capital_income_eur, dec!(4));
    }
}

//! End-to-end scenarios over the full pipeline with a pinned price oracle

use chrono::NaiveDate;
use qntropy::assets::Asset;
use qntropy::config::Config;
use qntropy::pipeline;
use qntropy::prices::{FixedProvider, PriceCache, PriceOracle, QuoteProvider};
use qntropy::snapshot::read_snapshot;
use qntropy::tax::events::{Holding, IncomeCategory, TaxEventKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::io::Cursor;

const HEADER: &str = "Type,Buy Amount,Buy Currency,Sell Amount,Sell Currency,Fee,Fee Currency,Exchange,Group,Comment,Date";

fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Oracle with an empty on-disk cache and the given pinned EUR quotes
fn pinned_oracle(quotes: &[(&str, &str, Decimal)]) -> PriceOracle {
    let tmp = tempfile::tempdir().unwrap();
    let cache = PriceCache::open(tmp.into_path().join("prices")).unwrap();
    let mut provider = FixedProvider::new();
    for (asset, date, price) in quotes {
        provider = provider.quote(asset, day(date), "EUR", *price);
    }
    let providers: Vec<Box<dyn QuoteProvider>> = vec![Box::new(provider)];
    PriceOracle::new(cache, providers)
}

fn run(
    csv_rows: &str,
    snapshot: Option<&str>,
    quotes: &[(&str, &str, Decimal)],
) -> pipeline::PipelineOutput {
    let csv = format!("{HEADER}\n{csv_rows}");
    let snapshot = snapshot.map(|s| read_snapshot(Cursor::new(s)).unwrap());
    let mut oracle = pinned_oracle(quotes);
    pipeline::run(
        &Config::default(),
        Cursor::new(csv),
        "test",
        snapshot.as_ref(),
        &mut oracle,
    )
    .unwrap()
}

fn disposals(output: &pipeline::PipelineOutput) -> Vec<&qntropy::tax::events::TaxEvent> {
    output
        .sink
        .events()
        .iter()
        .filter(|e| matches!(e.kind, TaxEventKind::CapitalDisposal { .. }))
        .collect()
}

#[test]
fn s1_pure_buy_sell_in_eur() {
    let output = run(
        "Trade,1,BTC,20000,EUR,10,EUR,Kraken,,,2023-01-02 10:00:00\n\
         Trade,25000,EUR,1,BTC,12,EUR,Kraken,,,2023-06-01 10:00:00",
        None,
        &[],
    );

    assert!(!output.needs_price);
    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        TaxEventKind::CapitalDisposal {
            asset,
            qty,
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            holding,
            ..
        } => {
            assert_eq!(asset, &Asset::new("BTC"));
            assert_eq!(*qty, dec!(1));
            assert_eq!(*proceeds_eur, dec!(24988));
            assert_eq!(*cost_basis_eur, dec!(20010));
            assert_eq!(*gain_eur, dec!(4978));
            assert_eq!(*holding, Holding::Short);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(events[0].tax_year, 2023);
    assert!(!events[0].synthetic_inputs);
}

#[test]
fn s2_crypto_to_crypto_swap() {
    let output = run(
        "Trade,2,ETH,3000,EUR,,,Kraken,,,2023-01-02 10:00:00\n\
         Trade,0.08,BTC,2,ETH,,,Kraken,,,2023-03-01 10:00:00",
        None,
        &[
            ("BTC", "2023-03-01", dec!(37500)),
            ("ETH", "2023-03-01", dec!(1490)),
        ],
    );

    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        TaxEventKind::CapitalDisposal {
            asset,
            qty,
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            holding,
            ..
        } => {
            assert_eq!(asset, &Asset::new("ETH"));
            assert_eq!(*qty, dec!(2));
            assert_eq!(*proceeds_eur, dec!(3000));
            assert_eq!(*cost_basis_eur, dec!(3000));
            assert_eq!(*gain_eur, dec!(0));
            assert_eq!(*holding, Holding::Short);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // The residual position is the fresh 0.08 BTC lot
    assert_eq!(output.balances[&Asset::new("BTC")], dec!(0.08));
    assert_eq!(output.balances[&Asset::new("ETH")], dec!(0));
}

#[test]
fn s3_missing_history_gets_zero_basis_repair() {
    let output = run(
        "Withdrawal,,,0.5,BTC,,,Kraken,,,2022-05-10 10:00:00",
        None,
        &[("BTC", "2022-05-10", dec!(30000))],
    );

    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        TaxEventKind::CapitalDisposal {
            qty,
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            holding,
            ..
        } => {
            assert_eq!(*qty, dec!(0.5));
            assert_eq!(*proceeds_eur, dec!(15000));
            assert_eq!(*cost_basis_eur, dec!(0));
            assert_eq!(*gain_eur, dec!(15000));
            assert_eq!(*holding, Holding::Short);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events[0].synthetic_inputs);
    assert!(output
        .sink
        .audits()
        .iter()
        .any(|a| a.reason.contains("balance_repair")));
    assert_eq!(output.balances[&Asset::new("BTC")], dec!(0));
}

#[test]
fn s4_staking_income_then_disposal() {
    let output = run(
        "Staking,10,ADA,,,,,Kraken,,,2023-02-01 10:00:00\n\
         Trade,6,EUR,10,ADA,,,Kraken,,,2023-05-01 10:00:00",
        None,
        &[("ADA", "2023-02-01", dec!(0.40))],
    );

    let events = output.sink.events();
    assert_eq!(events.len(), 2);

    match &events[0].kind {
        TaxEventKind::Income {
            asset,
            qty,
            fmv_eur,
            category,
        } => {
            assert_eq!(asset, &Asset::new("ADA"));
            assert_eq!(*qty, dec!(10));
            assert_eq!(*fmv_eur, dec!(4.00));
            assert_eq!(*category, IncomeCategory::MovableCapital);
        }
        other => panic!("expected income first, got {other:?}"),
    }
    match &events[1].kind {
        TaxEventKind::CapitalDisposal {
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            holding,
            ..
        } => {
            assert_eq!(*proceeds_eur, dec!(6.00));
            assert_eq!(*cost_basis_eur, dec!(4.00));
            assert_eq!(*gain_eur, dec!(2.00));
            assert_eq!(*holding, Holding::Short);
        }
        other => panic!("expected disposal second, got {other:?}"),
    }
}

#[test]
fn s5_partial_fifo_consumption() {
    let output = run(
        "Trade,1,BTC,10000,EUR,,,Kraken,,,2022-01-01 10:00:00\n\
         Trade,1,BTC,30000,EUR,,,Kraken,,,2023-01-01 10:00:00\n\
         Trade,60000,EUR,1.5,BTC,,,Kraken,,,2024-02-01 10:00:00",
        None,
        &[],
    );

    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        TaxEventKind::CapitalDisposal {
            qty,
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            holding,
            lots_consumed,
            ..
        } => {
            assert_eq!(*qty, dec!(1.5));
            assert_eq!(*proceeds_eur, dec!(60000));
            assert_eq!(*cost_basis_eur, dec!(25000));
            assert_eq!(*gain_eur, dec!(35000));
            assert_eq!(*holding, Holding::Long);
            assert_eq!(lots_consumed.len(), 2);
            assert_eq!(lots_consumed[0].qty, dec!(1));
            assert_eq!(lots_consumed[0].basis_eur, dec!(10000));
            assert_eq!(lots_consumed[1].qty, dec!(0.5));
            assert_eq!(lots_consumed[1].basis_eur, dec!(15000));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(output.balances[&Asset::new("BTC")], dec!(0.5));
}

#[test]
fn s6_final_balance_consolidation() {
    let output = run(
        "Trade,0.3,BTC,3000,EUR,,,Kraken,,,2023-01-02 10:00:00",
        Some("# as_of=2023-12-31T23:00:00Z\nBTC,0.25\n"),
        &[("BTC", "2023-12-31", dec!(40000))],
    );

    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        TaxEventKind::CapitalDisposal {
            qty,
            proceeds_eur,
            cost_basis_eur,
            gain_eur,
            ..
        } => {
            assert_eq!(*qty, dec!(0.05));
            assert_eq!(*proceeds_eur, dec!(2000));
            // Oldest (only) lot carries 10000 EUR/BTC
            assert_eq!(*cost_basis_eur, dec!(500.00));
            assert_eq!(*gain_eur, dec!(1500.00));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events[0].synthetic_inputs);
    assert_eq!(output.balances[&Asset::new("BTC")], dec!(0.25));
}

#[test]
fn determinism_two_runs_are_byte_identical() {
    let rows = "Trade,1,BTC,20000,EUR,10,EUR,Kraken,,,2023-01-02 10:00:00\n\
                Staking,10,ADA,,,,,Kraken,,,2023-02-01 10:00:00\n\
                Trade,0.01,BTC,5,ADA,,,Kraken,,,2023-03-01 10:00:00\n\
                Withdrawal,,,0.2,BTC,,,Kraken,,,2023-06-01 10:00:00";
    let quotes = [
        ("ADA", "2023-02-01", dec!(0.40)),
        ("BTC", "2023-03-01", dec!(37500)),
        ("ADA", "2023-03-01", dec!(0.35)),
        ("BTC", "2023-06-01", dec!(26000)),
    ];

    let mut first = Vec::new();
    run(rows, None, &quotes)
        .sink
        .write_events_csv(&mut first)
        .unwrap();
    let mut second = Vec::new();
    run(rows, None, &quotes)
        .sink
        .write_events_csv(&mut second)
        .unwrap();

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn missing_price_beyond_window_marks_run_non_final() {
    let output = run(
        "Deposit,1,XMR,,,,,Kraken,,,2023-01-01 10:00:00\n\
         Withdrawal,,,1,XMR,,,Kraken,,,2023-06-01 10:00:00",
        None,
        &[("XMR", "2023-01-01", dec!(150))],
    );
    assert!(output.needs_price);
    assert!(disposals(&output).is_empty());
}

#[test]
fn price_fallback_within_window_is_used_and_audited() {
    // Disposal two days after the last available quote
    let output = run(
        "Deposit,1,BTC,,,,,Kraken,,,2023-01-01 10:00:00\n\
         Withdrawal,,,1,BTC,,,Kraken,,,2023-01-03 10:00:00",
        None,
        &[("BTC", "2023-01-01", dec!(20000))],
    );

    let events = disposals(&output);
    assert_eq!(events.len(), 1);
    assert!(output
        .sink
        .audits()
        .iter()
        .any(|a| a.reason.contains("price_fallback_days=2")));
}

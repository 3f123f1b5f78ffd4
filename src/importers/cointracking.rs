use crate::assets::Asset;
use crate::config::Config;
use crate::tax::events::{AuditCategory, AuditEntry};
use crate::transaction::{sort_stream, Leg, Tx, TxKind};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Read;

/// Source type strings mapped to canonical kinds. Anything absent fails the
/// run with `UnknownTxKind` unless skipping is enabled.
const KIND_TABLE: &[(&str, TxKind)] = &[
    ("Trade", TxKind::Trade),
    ("Buy", TxKind::Trade),
    ("Sell", TxKind::Trade),
    ("Deposit", TxKind::Deposit),
    ("Withdrawal", TxKind::Withdrawal),
    ("Staking", TxKind::StakingReward),
    ("Staking Reward", TxKind::StakingReward),
    ("Interest", TxKind::LendingInterest),
    ("Lending Interest", TxKind::LendingInterest),
    ("Airdrop", TxKind::Airdrop),
    ("Fork", TxKind::Fork),
    ("Mining", TxKind::Income),
    ("Income", TxKind::Income),
    ("Transfer", TxKind::TransferInternal),
    ("Fee", TxKind::FeeOnly),
];

/// Cointracking exports rename a few columns depending on export flavour
const COLUMN_ALIASES: &[(&str, &str)] = &[
    ("Cur.", "Buy Currency"),
    ("Cur..1", "Sell Currency"),
    ("Cur..2", "Fee Currency"),
    ("Buy", "Buy Amount"),
    ("Sell", "Sell Amount"),
];

const REQUIRED_COLUMNS: &[&str] = &[
    "Type",
    "Buy Amount",
    "Buy Currency",
    "Sell Amount",
    "Sell Currency",
    "Fee",
    "Fee Currency",
    "Exchange",
    "Date",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
];

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("missing required columns in CSV: {0}")]
    MissingColumns(String),
    #[error("unknown transaction kind '{kind}' at row {row}")]
    UnknownTxKind { kind: String, row: usize },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Per-row problems recovered locally: the row is skipped with an audit
/// entry and parsing continues.
#[derive(Debug, thiserror::Error)]
enum RowError {
    #[error("unparseable date '{0}'")]
    BadDate(String),
    #[error("invalid {field} amount '{value}'")]
    BadAmount { field: &'static str, value: String },
    #[error("{field} amount must be positive, got '{value}'")]
    NonPositiveAmount { field: &'static str, value: String },
    #[error("{0}")]
    Invariant(#[from] crate::transaction::TxError),
}

/// Result of an import pass: the sorted canonical stream plus the audit
/// trail of skipped rows.
#[derive(Debug)]
pub struct Import {
    pub txs: Vec<Tx>,
    pub audits: Vec<AuditEntry>,
}

/// Normalizer for the Cointracking.info trade-table full export.
pub struct CointrackingImporter {
    tz: Tz,
    skip_unknown: bool,
}

impl CointrackingImporter {
    pub fn new(config: &Config) -> CointrackingImporter {
        CointrackingImporter {
            tz: config.tz,
            skip_unknown: config.skip_unknown,
        }
    }

    /// Read and normalize all rows. `source_name` seeds the transaction ids
    /// (typically the input file stem).
    pub fn import<R: Read>(&self, reader: R, source_name: &str) -> Result<Import, ImportError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);

        let columns = resolve_columns(rdr.headers()?)?;
        let mut txs = Vec::new();
        let mut audits = Vec::new();

        for (idx, record) in rdr.records().enumerate() {
            // Header is line 1, first data row is line 2
            let row = idx + 2;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping unreadable row {row}: {err}");
                    audits.push(skip_audit(row, format!("unreadable row: {err}")));
                    continue;
                }
            };
            let type_str = get(&columns, &record, "Type");
            let kind = match lookup_kind(type_str) {
                Some(kind) => kind,
                None => {
                    if self.skip_unknown {
                        log::warn!("skipping row {row} with unknown type '{type_str}'");
                        audits.push(skip_audit(row, format!("unknown type '{type_str}'")));
                        continue;
                    }
                    return Err(ImportError::UnknownTxKind {
                        kind: type_str.to_string(),
                        row,
                    });
                }
            };

            match self.parse_row(&columns, &record, kind, type_str, source_name, row) {
                Ok(tx) => txs.push(tx),
                Err(err) => {
                    log::warn!("skipping row {row}: {err}");
                    audits.push(skip_audit(row, err.to_string()));
                }
            }
        }

        log::info!("imported {} transactions ({} rows skipped)", txs.len(), audits.len());
        sort_stream(&mut txs);
        Ok(Import { txs, audits })
    }

    fn parse_row(
        &self,
        columns: &HashMap<String, usize>,
        record: &csv::StringRecord,
        kind: TxKind,
        type_str: &str,
        source_name: &str,
        row: usize,
    ) -> Result<Tx, RowError> {
        let field = |name: &str| get(columns, record, name);
        let instant = self.parse_date(field("Date"))?;
        let in_leg = parse_leg(field("Buy Amount"), field("Buy Currency"), "Buy Amount")?;
        let out_leg = parse_leg(field("Sell Amount"), field("Sell Currency"), "Sell Amount")?;
        let fee_leg = parse_leg(field("Fee"), field("Fee Currency"), "Fee")?;

        // A one-legged Buy is a plain acquisition and a one-legged Sell a
        // plain disposal; only rows with both legs carry trade semantics.
        let kind = match kind {
            TxKind::Trade if type_str.eq_ignore_ascii_case("Buy") && out_leg.is_none() => {
                TxKind::Deposit
            }
            TxKind::Trade if type_str.eq_ignore_ascii_case("Sell") && in_leg.is_none() => {
                TxKind::Withdrawal
            }
            kind => kind,
        };

        let opt = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };

        let tx = Tx {
            id: format!("{source_name}-{row}"),
            instant,
            kind,
            in_leg,
            out_leg,
            fee_leg,
            venue: field("Exchange").to_string(),
            group: opt(field("Group")),
            comment: opt(field("Comment")),
            synthetic: false,
            origin_note: None,
            ordinal: row,
        };
        tx.validate()?;
        Ok(tx)
    }

    fn parse_date(&self, value: &str) -> Result<DateTime<Utc>, RowError> {
        for format in DATE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                let local = self
                    .tz
                    .from_local_datetime(&naive)
                    .earliest()
                    .ok_or_else(|| RowError::BadDate(value.to_string()))?;
                return Ok(local.with_timezone(&Utc));
            }
        }
        Err(RowError::BadDate(value.to_string()))
    }
}

fn get<'r>(columns: &HashMap<String, usize>, record: &'r csv::StringRecord, name: &str) -> &'r str {
    columns
        .get(name)
        .and_then(|&i| record.get(i))
        .unwrap_or("")
        .trim()
}

fn lookup_kind(type_str: &str) -> Option<TxKind> {
    KIND_TABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(type_str))
        .map(|(_, kind)| *kind)
}

/// Empty amount or currency means no leg at all; a present leg must carry a
/// strictly positive decimal.
fn parse_leg(
    amount: &str,
    currency: &str,
    field: &'static str,
) -> Result<Option<Leg>, RowError> {
    if amount.is_empty() || currency.is_empty() {
        return Ok(None);
    }
    let normalized = normalize_decimal(amount);
    let parsed: Decimal = normalized.parse().map_err(|_| RowError::BadAmount {
        field,
        value: amount.to_string(),
    })?;
    if parsed <= Decimal::ZERO {
        return Err(RowError::NonPositiveAmount {
            field,
            value: amount.to_string(),
        });
    }
    Ok(Some(Leg::new(Asset::new(currency), parsed)))
}

/// European exports sometimes use a decimal comma; `1.234,56` and `1234,56`
/// both normalize to dot notation.
fn normalize_decimal(value: &str) -> String {
    if value.contains(',') && value.contains('.') {
        value.replace('.', "").replace(',', ".")
    } else {
        value.replace(',', ".")
    }
}

fn resolve_columns(headers: &csv::StringRecord) -> Result<HashMap<String, usize>, ImportError> {
    let mut columns: HashMap<String, usize> = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let header = header.trim();
        let canonical = COLUMN_ALIASES
            .iter()
            .find(|(alias, _)| *alias == header)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(header);
        columns.entry(canonical.to_string()).or_insert(idx);
    }

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .filter(|col| !columns.contains_key(**col))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns(missing.join(", ")));
    }
    Ok(columns)
}

fn skip_audit(row: usize, reason: String) -> AuditEntry {
    AuditEntry::new(
        DateTime::UNIX_EPOCH,
        AuditCategory::RowSkipped,
        None,
        format!("row {row} skipped: {reason}"),
    )
}

use crate::assets::Asset;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot is missing the '# as_of=<ISO-8601>' header")]
    MissingAsOf,
    #[error("invalid as_of timestamp: {0}")]
    InvalidAsOf(String),
    #[error("invalid snapshot line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("snapshot io: {0}")]
    Io(String),
}

/// User-supplied final balances: per-asset amounts valid at `as_of`. Assets
/// absent from the file are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub as_of: DateTime<Utc>,
    pub balances: HashMap<Asset, Decimal>,
}

impl BalanceSnapshot {
    pub fn balance(&self, asset: &Asset) -> Decimal {
        self.balances.get(asset).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Read a two-column `asset, amount` CSV with a `# as_of=` comment header.
pub fn read_snapshot<R: Read>(reader: R) -> Result<BalanceSnapshot, SnapshotError> {
    let reader = BufReader::new(reader);
    let mut as_of: Option<DateTime<Utc>> = None;
    let mut balances: HashMap<Asset, Decimal> = HashMap::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| SnapshotError::Io(e.to_string()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(value) = comment.strip_prefix("as_of=") {
                as_of = Some(parse_as_of(value.trim())?);
            }
            continue;
        }

        let mut fields = line.splitn(2, ',');
        let symbol = fields.next().unwrap_or("").trim();
        let amount = fields.next().unwrap_or("").trim();

        // Tolerate an optional "asset,amount" header row
        if line_no <= 2 && symbol.eq_ignore_ascii_case("asset") {
            continue;
        }

        if symbol.is_empty() || amount.is_empty() {
            return Err(SnapshotError::InvalidLine {
                line: line_no,
                reason: "expected 'asset, amount'".to_string(),
            });
        }
        let amount: Decimal = amount.parse().map_err(|_| SnapshotError::InvalidLine {
            line: line_no,
            reason: format!("bad amount '{amount}'"),
        })?;
        if amount < Decimal::ZERO {
            return Err(SnapshotError::InvalidLine {
                line: line_no,
                reason: "snapshot amounts cannot be negative".to_string(),
            });
        }
        balances.insert(Asset::new(symbol), amount);
    }

    let as_of = as_of.ok_or(SnapshotError::MissingAsOf)?;
    Ok(BalanceSnapshot { as_of, balances })
}

fn parse_as_of(value: &str) -> Result<DateTime<Utc>, SnapshotError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        // A bare date means end of that day
        let dt = date.and_hms_opt(23, 59, 59).unwrap();
        return Ok(dt.and_utc());
    }
    Err(SnapshotError::InvalidAsOf(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    #[test]
    fn reads_snapshot_with_header() {
        let input = "# as_of=2023-12-31T00:00:00Z\nBTC,0.25\neth, 1.5\n";
        let snapshot = read_snapshot(Cursor::new(input)).unwrap();
        assert_eq!(snapshot.balance(&Asset::new("BTC")), dec!(0.25));
        assert_eq!(snapshot.balance(&Asset::new("ETH")), dec!(1.5));
        assert_eq!(snapshot.balance(&Asset::new("ADA")), dec!(0));
        assert_eq!(
            snapshot.as_of,
            DateTime::parse_from_rfc3339("2023-12-31T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn optional_column_header_is_tolerated() {
        let input = "# as_of=2023-12-31\nasset,amount\nBTC,0.25\n";
        let snapshot = read_snapshot(Cursor::new(input)).unwrap();
        assert_eq!(snapshot.balance(&Asset::new("BTC")), dec!(0.25));
    }

    #[test]
    fn missing_as_of_fails() {
        let err = read_snapshot(Cursor::new("BTC,0.25\n")).unwrap_err();
        assert_eq!(err, SnapshotError::MissingAsOf);
    }

    #[test]
    fn negative_amounts_rejected() {
        let input = "# as_of=2023-12-31\nBTC,-1\n";
        assert!(matches!(
            read_snapshot(Cursor::new(input)).unwrap_err(),
            SnapshotError::InvalidLine { .. }
        ));
    }

    #[test]
    fn bad_as_of_rejected() {
        let input = "# as_of=yesterday\nBTC,1\n";
        assert!(matches!(
            read_snapshot(Cursor::new(input)).unwrap_err(),
            SnapshotError::InvalidAsOf(_)
        ));
    }
}

use crate::tax::events::{round_eur, AuditEntry, TaxEvent, TaxEventKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only store of tax events and audit entries. Supports only append
/// and ordered scan; records are immutable once handed over.
#[derive(Debug, Default)]
pub struct EventSink {
    events: Vec<TaxEvent>,
    audits: Vec<AuditEntry>,
}

impl EventSink {
    pub fn new() -> EventSink {
        EventSink::default()
    }

    pub fn append_event(&mut self, event: TaxEvent) {
        self.events.push(event);
    }

    pub fn append_audit(&mut self, audit: AuditEntry) {
        self.audits.push(audit);
    }

    pub fn extend_events(&mut self, events: impl IntoIterator<Item = TaxEvent>) {
        self.events.extend(events);
    }

    pub fn extend_audits(&mut self, audits: impl IntoIterator<Item = AuditEntry>) {
        self.audits.extend(audits);
    }

    pub fn events(&self) -> &[TaxEvent] {
        &self.events
    }

    pub fn audits(&self) -> &[AuditEntry] {
        &self.audits
    }

    pub fn write_events_csv<W: Write>(&self, writer: W) -> color_eyre::Result<()> {
        let rows = self.events.iter().map(EventRow::from);
        write_csv(rows, writer)
    }

    pub fn write_audits_csv<W: Write>(&self, writer: W) -> color_eyre::Result<()> {
        let rows = self.audits.iter().map(AuditRow::from);
        write_csv(rows, writer)
    }

    /// Write `events.csv` and `audit.csv` under `dir`, committing each file
    /// through a temp file and an atomic rename so a cancelled run never
    /// leaves a partial output behind.
    pub fn commit(&self, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir)?;
        let events_path = dir.join("events.csv");
        let audit_path = dir.join("audit.csv");
        write_atomic(&events_path, |w| self.write_events_csv(w))?;
        write_atomic(&audit_path, |w| self.write_audits_csv(w))?;
        log::info!(
            "wrote {} events and {} audit entries to {}",
            self.events.len(),
            self.audits.len(),
            dir.display()
        );
        Ok((events_path, audit_path))
    }
}

fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut Vec<u8>) -> color_eyre::Result<()>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    write(&mut buffer).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let tmp = path.with_extension("csv.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn write_csv<I, R, W>(records: I, writer: W) -> color_eyre::Result<()>
where
    I: IntoIterator<Item = R>,
    R: Serialize,
    W: Write,
{
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// One CSV row per tax event. Income events carry their fair market value in
/// the proceeds column; the remaining disposal columns stay empty.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventRow {
    pub tax_year: i32,
    pub kind: String,
    pub instant_utc: String,
    pub asset: String,
    pub qty: Decimal,
    pub proceeds_eur: Decimal,
    pub cost_basis_eur: Option<Decimal>,
    pub gain_eur: Option<Decimal>,
    pub holding: Option<String>,
    pub income_category: Option<String>,
    pub source_tx_id: String,
    pub synthetic_inputs: bool,
    pub lots_consumed_json: String,
}

impl From<&TaxEvent> for EventRow {
    fn from(event: &TaxEvent) -> EventRow {
        match &event.kind {
            TaxEventKind::CapitalDisposal {
                asset,
                qty,
                proceeds_eur,
                cost_basis_eur,
                gain_eur,
                holding,
                lots_consumed,
            } => EventRow {
                tax_year: event.tax_year,
                kind: "CapitalDisposal".to_string(),
                instant_utc: event.instant.to_rfc3339(),
                asset: asset.symbol().to_string(),
                qty: *qty,
                proceeds_eur: round_eur(*proceeds_eur),
                cost_basis_eur: Some(round_eur(*cost_basis_eur)),
                gain_eur: Some(round_eur(*gain_eur)),
                holding: Some(holding.display().to_string()),
                income_category: None,
                source_tx_id: event.source_tx_id.clone(),
                synthetic_inputs: event.synthetic_inputs,
                lots_consumed_json: serde_json::to_string(lots_consumed)
                    .unwrap_or_else(|_| "[]".to_string()),
            },
            TaxEventKind::Income {
                asset,
                qty,
                fmv_eur,
                category,
            } => EventRow {
                tax_year: event.tax_year,
                kind: "Income".to_string(),
                instant_utc: event.instant.to_rfc3339(),
                asset: asset.symbol().to_string(),
                qty: *qty,
                proceeds_eur: round_eur(*fmv_eur),
                cost_basis_eur: None,
                gain_eur: None,
                holding: None,
                income_category: Some(category.display().to_string()),
                source_tx_id: event.source_tx_id.clone(),
                synthetic_inputs: event.synthetic_inputs,
                lots_consumed_json: "[]".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditRow {
    pub instant_utc: String,
    pub category: String,
    pub subject_tx_id: Option<String>,
    pub reason: String,
}

impl From<&AuditEntry> for AuditRow {
    fn from(audit: &AuditEntry) -> AuditRow {
        AuditRow {
            instant_utc: audit.instant.to_rfc3339(),
            category: audit.category.display().to_string(),
            subject_tx_id: audit.subject_tx_id.clone(),
            reason: audit.reason.clone(),
        }
    }
}

/// Read back an events CSV written by `EventSink` (used by the report
/// command).
pub fn read_events_csv<R: std::io::Read>(reader: R) -> color_eyre::Result<Vec<EventRow>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let rows: Result<Vec<EventRow>, _> = rdr.deserialize().collect();
    Ok(rows?)
}

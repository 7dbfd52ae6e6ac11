//! Upcoming-events view and CSV export.
//!
//! Flattens the stored schedules into one time-ordered list of reminder and
//! run-out events, for display or for import into a calendar.

use crate::{PrescriptionRecord, ReminderKind, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use uuid::Uuid;

/// What happens at a calendar entry
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalendarEvent {
    PrimaryReminder,
    SecondaryReminder,
    Depletion,
}

impl From<ReminderKind> for CalendarEvent {
    fn from(kind: ReminderKind) -> Self {
        match kind {
            ReminderKind::Primary => CalendarEvent::PrimaryReminder,
            ReminderKind::Secondary => CalendarEvent::SecondaryReminder,
        }
    }
}

impl std::fmt::Display for CalendarEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CalendarEvent::PrimaryReminder => "reminder",
            CalendarEvent::SecondaryReminder => "follow-up",
            CalendarEvent::Depletion => "runs out",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalendarEntry {
    pub at: DateTime<Utc>,
    pub prescription_id: Uuid,
    pub name: String,
    pub event: CalendarEvent,
}

/// A row in the CSV output
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    at: String,
    event: CalendarEvent,
    name: &'a str,
    prescription_id: String,
}

impl<'a> From<&'a CalendarEntry> for CsvRow<'a> {
    fn from(entry: &'a CalendarEntry) -> Self {
        CsvRow {
            at: entry.at.to_rfc3339(),
            event: entry.event,
            name: &entry.name,
            prescription_id: entry.prescription_id.to_string(),
        }
    }
}

/// Events in `[from, until)` for every prescription still awaiting refill
///
/// Acknowledged prescriptions have no live reminders and are left out
/// entirely, including their run-out date.
pub fn upcoming(
    records: &[PrescriptionRecord],
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<CalendarEntry> {
    let in_window = |at: DateTime<Utc>| at >= from && at < until;
    let mut entries = Vec::new();

    for record in records
        .iter()
        .filter(|r| r.prescription.refill_state.reminders_live())
    {
        let entry = |at, event| CalendarEntry {
            at,
            prescription_id: record.id(),
            name: record.prescription.name.clone(),
            event,
        };

        entries.extend(
            record
                .plan
                .reminders
                .iter()
                .filter(|r| in_window(r.fire_at))
                .map(|r| entry(r.fire_at, CalendarEvent::from(r.kind))),
        );
        if in_window(record.depletion) {
            entries.push(entry(record.depletion, CalendarEvent::Depletion));
        }
    }

    entries.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.name.cmp(&b.name)));
    entries
}

/// Write entries to a fresh CSV file, replacing any previous export
pub fn write_csv(entries: &[CalendarEntry], path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_writer(File::create(path)?);
    for entry in entries {
        writer.serialize(CsvRow::from(entry))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} calendar entries to {:?}", entries.len(), path);
    Ok(entries.len())
}

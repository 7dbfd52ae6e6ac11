//! Core domain types for the refill tracker.
//!
//! This module defines the fundamental types used throughout the system:
//! - Prescriptions and the candidates/edits that produce them
//! - Reminder preferences
//! - Reminder plans and reminder identifiers
//! - The persisted record tying a prescription to its computed schedule

use crate::{Error, Interval, IntervalUnit, RefillState, Result, StartAnchor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Reminder Preferences
// ============================================================================

/// How far ahead of depletion to warn, and how often to nudge afterwards
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderPreferences {
    pub primary_offset: Interval,
    pub secondary_count: u32,
    pub secondary_interval: Option<Interval>,
}

impl ReminderPreferences {
    /// Validate and build preferences.
    ///
    /// A spacing is required whenever secondary reminders are requested.
    pub fn new(
        primary_offset: Interval,
        secondary_count: u32,
        secondary_interval: Option<Interval>,
    ) -> Result<Self> {
        if secondary_count > 0 && secondary_interval.is_none() {
            return Err(Error::InvalidReminderConfig(format!(
                "{} secondary reminders requested without a spacing",
                secondary_count
            )));
        }
        Ok(Self {
            primary_offset,
            secondary_count,
            secondary_interval,
        })
    }

    /// Only the primary warning, no follow-ups
    pub fn primary_only(primary_offset: Interval) -> Self {
        Self {
            primary_offset,
            secondary_count: 0,
            secondary_interval: None,
        }
    }

    /// Build preferences from raw form amounts.
    ///
    /// Bad amounts are reported as `InvalidReminderConfig` rather than
    /// `InvalidInterval`, since they belong to the reminder settings.
    pub fn from_units(
        primary_amount: i64,
        primary_unit: IntervalUnit,
        secondary_count: u32,
        secondary_every: Option<(i64, IntervalUnit)>,
    ) -> Result<Self> {
        let primary_offset = Interval::new(primary_amount, primary_unit)
            .map_err(|e| Error::InvalidReminderConfig(format!("primary offset: {}", e)))?;

        let secondary_interval = match secondary_every {
            Some((amount, unit)) if secondary_count > 0 => Some(
                Interval::new(amount, unit).map_err(|e| {
                    Error::InvalidReminderConfig(format!("secondary spacing: {}", e))
                })?,
            ),
            _ => None,
        };

        Self::new(primary_offset, secondary_count, secondary_interval)
    }
}

// ============================================================================
// Prescription Types
// ============================================================================

/// A fully populated candidate handed over by the add flow
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrescriptionDraft {
    pub name: String,
    pub dosage_per_interval: u32,
    pub interval: Interval,
    pub supply_count: u32,
    pub start: StartAnchor,
    pub reminders: ReminderPreferences,
    pub notes: Option<String>,
}

/// A tracked prescription
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub name: String,
    pub dosage_per_interval: u32,
    pub interval: Interval,
    pub supply_count: u32,
    pub start: StartAnchor,
    pub reminders: ReminderPreferences,
    pub refill_state: RefillState,
    /// Bumped every time the schedule is recomputed
    pub cycle: u32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prescription {
    /// Create a new prescription from a draft, in the first refill cycle
    pub fn from_draft(draft: PrescriptionDraft, now: DateTime<Utc>) -> Result<Self> {
        let prescription = Self {
            id: Uuid::new_v4(),
            name: draft.name.trim().to_string(),
            dosage_per_interval: draft.dosage_per_interval,
            interval: draft.interval,
            supply_count: draft.supply_count,
            start: draft.start,
            reminders: draft.reminders,
            refill_state: RefillState::Active,
            cycle: 1,
            notes: normalize_notes(draft.notes),
            created_at: now,
            updated_at: now,
        };
        prescription.validate()?;
        Ok(prescription)
    }

    /// Check the field-level invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidPrescription("name must not be empty".into()));
        }
        if self.dosage_per_interval == 0 {
            return Err(Error::InvalidDosage(
                "dosage per interval must be positive".into(),
            ));
        }
        if self.supply_count == 0 {
            return Err(Error::InvalidSupply("supply count must be positive".into()));
        }
        if self.reminders.secondary_count > 0 && self.reminders.secondary_interval.is_none() {
            return Err(Error::InvalidReminderConfig(
                "secondary reminders need a spacing".into(),
            ));
        }
        Ok(())
    }

    /// `true` once the current cycle has been marked as refilled
    pub fn refill_status(&self) -> bool {
        self.refill_state == RefillState::Acknowledged
    }
}

/// Replacement values for an existing prescription.
///
/// Fields left as `None` keep their current value.
#[derive(Clone, Debug, Default)]
pub struct PrescriptionEdit {
    pub name: Option<String>,
    pub dosage_per_interval: Option<u32>,
    pub interval: Option<Interval>,
    pub supply_count: Option<u32>,
    pub start: Option<StartAnchor>,
    pub reminders: Option<ReminderPreferences>,
    /// `Some("")` clears the notes
    pub notes: Option<String>,
}

impl PrescriptionEdit {
    /// Whether this edit changes anything the schedule is derived from
    pub fn changes_schedule(&self) -> bool {
        self.dosage_per_interval.is_some()
            || self.interval.is_some()
            || self.supply_count.is_some()
            || self.start.is_some()
            || self.reminders.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.changes_schedule() && self.name.is_none() && self.notes.is_none()
    }

    /// Produce the edited prescription without touching `current`
    pub fn apply_to(&self, current: &Prescription, now: DateTime<Utc>) -> Result<Prescription> {
        let mut next = current.clone();
        if let Some(name) = &self.name {
            next.name = name.trim().to_string();
        }
        if let Some(dosage) = self.dosage_per_interval {
            next.dosage_per_interval = dosage;
        }
        if let Some(interval) = self.interval {
            next.interval = interval;
        }
        if let Some(supply) = self.supply_count {
            next.supply_count = supply;
        }
        if let Some(start) = self.start {
            next.start = start;
        }
        if let Some(reminders) = &self.reminders {
            next.reminders = reminders.clone();
        }
        if let Some(notes) = &self.notes {
            next.notes = normalize_notes(Some(notes.clone()));
        }
        next.updated_at = now;
        next.validate()?;
        Ok(next)
    }
}

fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

// ============================================================================
// Reminder Plan Types
// ============================================================================

/// Whether a reminder is the first warning or a follow-up nudge
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Primary,
    Secondary,
}

/// One entry of a reminder plan
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reminder {
    /// Position in the plan, the primary reminder is 0
    pub seq: u32,
    pub kind: ReminderKind,
    pub fire_at: DateTime<Utc>,
}

/// Time-ordered reminders for one refill cycle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReminderPlan {
    pub reminders: Vec<Reminder>,
}

impl ReminderPlan {
    pub fn len(&self) -> usize {
        self.reminders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reminders.is_empty()
    }

    pub fn primary(&self) -> Option<&Reminder> {
        self.reminders
            .iter()
            .find(|r| r.kind == ReminderKind::Primary)
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &Reminder> {
        self.reminders
            .iter()
            .filter(|r| r.kind == ReminderKind::Secondary)
    }

    pub fn instants(&self) -> Vec<DateTime<Utc>> {
        self.reminders.iter().map(|r| r.fire_at).collect()
    }
}

/// Identifies a reminder with the dispatcher: refill cycle plus plan position
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReminderId {
    pub cycle: u32,
    pub seq: u32,
}

impl ReminderId {
    pub fn new(cycle: u32, seq: u32) -> Self {
        Self { cycle, seq }
    }
}

impl fmt::Display for ReminderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}-r{}", self.cycle, self.seq)
    }
}

impl FromStr for ReminderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Other(format!("Invalid reminder id: {}", s));
        let (cycle, seq) = s
            .strip_prefix('c')
            .and_then(|rest| rest.split_once("-r"))
            .ok_or_else(invalid)?;
        Ok(Self {
            cycle: cycle.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

// ============================================================================
// Persisted Record
// ============================================================================

/// A prescription with its derived schedule, persisted as one unit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrescriptionRecord {
    pub prescription: Prescription,
    pub depletion: DateTime<Utc>,
    pub plan: ReminderPlan,
}

impl PrescriptionRecord {
    pub fn id(&self) -> Uuid {
        self.prescription.id
    }

    /// Dispatcher ids for every reminder in the current plan
    pub fn reminder_ids(&self) -> Vec<ReminderId> {
        self.plan
            .reminders
            .iter()
            .map(|r| ReminderId::new(self.prescription.cycle, r.seq))
            .collect()
    }
}

//! Reminder plan generation.
//!
//! The plan opens with a primary warning `primary_offset` before depletion,
//! followed by up to `secondary_count` nudges spaced `secondary_interval`
//! apart. Nudges that would land at or after depletion are dropped, so a plan
//! may hold fewer secondaries than requested.
//!
//! Generation is a pure function of its inputs. Entries already in the past
//! are kept; deciding what to do with them is the coordinator's job.

use crate::{Error, Prescription, Reminder, ReminderKind, ReminderPlan, Result};
use chrono::{DateTime, Duration, Utc};

/// Build the ordered reminder plan for one depletion instant
pub fn generate_plan(
    depletion: DateTime<Utc>,
    primary_offset: Duration,
    secondary_count: u32,
    secondary_interval: Option<Duration>,
) -> Result<ReminderPlan> {
    if primary_offset <= Duration::zero() {
        return Err(Error::InvalidReminderConfig(format!(
            "primary offset must be positive, got {}",
            primary_offset
        )));
    }

    let spacing = match secondary_interval {
        _ if secondary_count == 0 => None,
        Some(spacing) if spacing > Duration::zero() => Some(spacing),
        Some(spacing) => {
            return Err(Error::InvalidReminderConfig(format!(
                "secondary spacing must be positive, got {}",
                spacing
            )))
        }
        None => {
            return Err(Error::InvalidReminderConfig(format!(
                "{} secondary reminders requested without a spacing",
                secondary_count
            )))
        }
    };

    let primary_at = depletion.checked_sub_signed(primary_offset).ok_or_else(|| {
        Error::OutOfRange(format!("{} before {} is not representable", primary_offset, depletion))
    })?;

    let mut reminders = vec![Reminder {
        seq: 0,
        kind: ReminderKind::Primary,
        fire_at: primary_at,
    }];

    if let Some(spacing) = spacing {
        let mut fire_at = primary_at;
        for seq in 1..=secondary_count {
            fire_at = match fire_at.checked_add_signed(spacing) {
                Some(next) if next < depletion => next,
                // Everything after this point is at or past depletion.
                _ => break,
            };
            reminders.push(Reminder {
                seq,
                kind: ReminderKind::Secondary,
                fire_at,
            });
        }

        let kept = reminders.len() - 1;
        if kept < secondary_count as usize {
            tracing::debug!(
                "Clipped secondary reminders at depletion {}: kept {} of {}",
                depletion,
                kept,
                secondary_count
            );
        }
    }

    Ok(ReminderPlan { reminders })
}

/// Plan for a prescription whose depletion is already known
pub fn plan_for(prescription: &Prescription, depletion: DateTime<Utc>) -> Result<ReminderPlan> {
    let prefs = &prescription.reminders;
    generate_plan(
        depletion,
        prefs.primary_offset.as_duration(),
        prefs.secondary_count,
        prefs.secondary_interval.map(|i| i.as_duration()),
    )
}

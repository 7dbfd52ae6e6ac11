//! Depletion calculation.
//!
//! The supply lasts for `floor(supply / dosage)` whole dosing events. The
//! depletion instant is that many intervals after the start. A remainder
//! smaller than one dose never adds a partial interval.

use crate::{interval, Error, Interval, Prescription, Result};
use chrono::{DateTime, Utc};

/// Number of full doses a supply sustains
pub fn dose_count(supply_count: u32, dosage_per_interval: u32) -> Result<u32> {
    if dosage_per_interval == 0 {
        return Err(Error::InvalidDosage(
            "dosage per interval must be positive".into(),
        ));
    }
    if supply_count == 0 {
        return Err(Error::InvalidSupply("supply count must be positive".into()));
    }
    Ok(supply_count / dosage_per_interval)
}

/// Compute the instant the supply runs out
pub fn compute_depletion(
    start: DateTime<Utc>,
    dosage_per_interval: u32,
    interval: Interval,
    supply_count: u32,
) -> Result<DateTime<Utc>> {
    let doses = dose_count(supply_count, dosage_per_interval)?;
    let depletion = interval::advance(start, interval, i64::from(doses))?;

    tracing::debug!(
        "Depletion: {} units / {} per dose = {} doses every {} from {} -> {}",
        supply_count,
        dosage_per_interval,
        doses,
        interval,
        start,
        depletion
    );

    Ok(depletion)
}

/// Depletion instant for a stored prescription
pub fn depletion_for(prescription: &Prescription) -> Result<DateTime<Utc>> {
    compute_depletion(
        prescription.start.instant(),
        prescription.dosage_per_interval,
        prescription.interval,
        prescription.supply_count,
    )
}

//! Supply duration classes.
//!
//! Pharmacies dispense in 30/60/90/100-day quantities. A class is turned into
//! a unit count using the prescription's dosing rate, rounding the number of
//! doses up so the supply covers at least the whole class.

use crate::{Error, Interval, IntervalUnit, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SupplyClass {
    Days30,
    Days60,
    Days90,
    Days100,
}

impl SupplyClass {
    pub const ALL: [SupplyClass; 4] = [
        SupplyClass::Days30,
        SupplyClass::Days60,
        SupplyClass::Days90,
        SupplyClass::Days100,
    ];

    pub fn days(self) -> u32 {
        match self {
            SupplyClass::Days30 => 30,
            SupplyClass::Days60 => 60,
            SupplyClass::Days90 => 90,
            SupplyClass::Days100 => 100,
        }
    }

    pub fn from_days(days: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.days() == days)
    }

    /// Units needed to cover this class at `dosage_per_interval` every `interval`
    pub fn units_for(self, dosage_per_interval: u32, interval: Interval) -> Result<u32> {
        if dosage_per_interval == 0 {
            return Err(Error::InvalidDosage(
                "dosage per interval must be positive".into(),
            ));
        }

        let span = i64::from(self.days()) * IntervalUnit::Days.minutes();
        let step = interval.as_minutes();
        let doses = (span + step - 1) / step;

        let units = u32::try_from(doses)
            .ok()
            .and_then(|d| d.checked_mul(dosage_per_interval))
            .ok_or_else(|| {
                Error::InvalidSupply(format!(
                    "{} of {} every {} needs more units than supported",
                    self, dosage_per_interval, interval
                ))
            })?;

        tracing::debug!(
            "{} at {} every {} -> {} units",
            self,
            dosage_per_interval,
            interval,
            units
        );
        Ok(units)
    }
}

impl FromStr for SupplyClass {
    type Err = Error;

    /// Accepts `30`, `30d`, `30-days`.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
        digits
            .parse::<u32>()
            .ok()
            .and_then(Self::from_days)
            .ok_or_else(|| {
                Error::InvalidSupply(format!(
                    "unknown supply class '{}', expected 30, 60, 90 or 100 days",
                    s
                ))
            })
    }
}

impl fmt::Display for SupplyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-day supply", self.days())
    }
}

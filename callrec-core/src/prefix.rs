//! Date-based key prefixes (`<root>YYYY/MM/DD/`) for a pipeline run.

use chrono::{Datelike, Days, NaiveDate};
use serde::Serialize;

use crate::error::{ConfigError, Result};

/// Trigger payload format for an explicit date override.
pub const SPECIFIC_DATE_FORMAT: &str = "%m/%d/%Y";

/// Which calendar day a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum DateSelection {
    Specific(NaiveDate),
    DaysAgo(u32),
}

impl DateSelection {
    /// Builds the selection from an optional `MM/DD/YYYY` override.
    ///
    /// A missing override selects the age-based day. A present but blank or
    /// malformed override is a configuration error, never a silent fallback.
    pub fn from_override(specific_date: Option<&str>, num_days_age: u32) -> Result<Self> {
        match specific_date {
            Some(value) => parse_specific_date(value).map(DateSelection::Specific),
            None => Ok(DateSelection::DaysAgo(num_days_age)),
        }
    }

    pub fn resolve(&self, today: NaiveDate) -> Result<NaiveDate> {
        match *self {
            DateSelection::Specific(date) => Ok(date),
            DateSelection::DaysAgo(days) => {
                today
                    .checked_sub_days(Days::new(u64::from(days)))
                    .ok_or_else(|| ConfigError::Invalid {
                        field: "listing.num_days_age",
                        reason: format!("{days} days before {today} is out of range"),
                    })
            }
        }
    }
}

pub fn parse_specific_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), SPECIFIC_DATE_FORMAT).map_err(|_| {
        ConfigError::InvalidDate {
            value: value.to_string(),
        }
    })
}

/// Joins `root` and the zero-padded date, with exactly one `/` between them.
pub fn build_prefix(root: &str, date: NaiveDate) -> String {
    let root = root.trim_end_matches('/');
    let day = format!("{:04}/{:02}/{:02}/", date.year(), date.month(), date.day());
    if root.is_empty() {
        day
    } else {
        format!("{root}/{day}")
    }
}

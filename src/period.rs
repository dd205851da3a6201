//! Reporting periods: a day, an ISO week (Monday to Sunday) or a calendar
//! month, identified by granularity and end date.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DigestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" | "giornaliera" => Ok(Granularity::Day),
            "week" | "weekly" | "settimanale" => Ok(Granularity::Week),
            "month" | "monthly" | "mensile" => Ok(Granularity::Month),
            other => Err(DigestError::Config(format!("unknown frequency '{other}'"))),
        }
    }
}

/// A reporting period. `end` is the last constituent day and anchors the
/// period; `start..=end` are contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub granularity: Granularity,
    pub end: NaiveDate,
}

impl Period {
    /// The period of the given granularity that contains `date`.
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Self {
        let end = match granularity {
            Granularity::Day => date,
            Granularity::Week => {
                let to_sunday = 6 - u64::from(date.weekday().num_days_from_monday());
                date + Days::new(to_sunday)
            }
            Granularity::Month => {
                let first = date - Days::new(u64::from(date.day0()));
                first + Months::new(1) - Days::new(1)
            }
        };

        Self { granularity, end }
    }

    /// The most recent period whose last day is not after `today`.
    ///
    /// Daily periods are due on their own day; weekly periods on Sunday;
    /// monthly periods on the last day of the month.
    pub fn latest_due(today: NaiveDate, granularity: Granularity) -> Self {
        let current = Self::containing(today, granularity);
        if current.end <= today {
            current
        } else {
            current.previous()
        }
    }

    pub fn start(&self) -> NaiveDate {
        match self.granularity {
            Granularity::Day => self.end,
            Granularity::Week => self.end - Days::new(6),
            Granularity::Month => self.end - Days::new(u64::from(self.end.day0())),
        }
    }

    /// Number of constituent days.
    pub fn num_days(&self) -> usize {
        (self.end - self.start()).num_days() as usize + 1
    }

    pub fn previous(&self) -> Self {
        Self::containing(self.start() - Days::new(1), self.granularity)
    }

    pub fn next(&self) -> Self {
        Self::containing(self.end + Days::new(1), self.granularity)
    }

    /// Human-readable label used in digest titles.
    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Day => self.end.format("%Y-%m-%d").to_string(),
            Granularity::Week => {
                let week = self.start().iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Granularity::Month => self.end.format("%Y-%m").to_string(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.granularity, self.label())
    }
}

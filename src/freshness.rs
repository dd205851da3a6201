//! Readiness of a (source, area, period) triple.
//!
//! The tracker only reports presence or absence of daily observations. It
//! does not wait, poll or know about publication times.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

use crate::observations::{ObservationStore, Source};
use crate::period::Period;

/// Why a stream will never become ready for a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Absence {
    /// The period ends after today.
    FuturePeriod,
    /// The source's complete area list does not include this area.
    UntrackedArea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Every constituent day is present.
    Ready,
    /// Some constituent day is still missing.
    Pending,
    /// Terminal: no data will ever exist for this combination.
    NotApplicable(Absence),
}

pub struct FreshnessTracker {
    store: Arc<ObservationStore>,
}

impl FreshnessTracker {
    pub fn new(store: Arc<ObservationStore>) -> Self {
        Self { store }
    }

    pub fn readiness(
        &self,
        source: Source,
        area: &str,
        period: &Period,
        today: NaiveDate,
    ) -> Readiness {
        if period.end > today {
            return Readiness::NotApplicable(Absence::FuturePeriod);
        }

        // Until every dataset of the source has loaded, a missing area may
        // just be a failed download.
        if self.store.areas_known(source) && !self.store.tracks_area(source, area) {
            return Readiness::NotApplicable(Absence::UntrackedArea);
        }

        let present = self
            .store
            .range(source, area, period.start(), period.end)
            .len();

        if present == period.num_days() {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    pub fn is_ready(&self, source: Source, area: &str, period: &Period, today: NaiveDate) -> bool {
        self.readiness(source, area, period, today) == Readiness::Ready
    }
}

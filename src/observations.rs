//! In-memory store of daily observations per (source, area).
//!
//! Observations are replaced whole by date: a revised dataset re-supplies a
//! date and readers see either the old or the new observation, never a mix.

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::DigestError;

/// Area name used for whole-country streams.
pub const NATIONAL_AREA: &str = "Italia";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Contagions,
    Vaccinations,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Contagions, Source::Vaccinations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Contagions => "contagions",
            Source::Vaccinations => "vaccinations",
        }
    }

    /// Local time at which the observation for `date` usually lands.
    ///
    /// Contagion figures are published in the late afternoon of the day
    /// they describe; vaccination figures in the early morning after.
    pub fn expected_at(&self, date: NaiveDate) -> NaiveDateTime {
        match self {
            Source::Contagions => date.and_time(hms(17, 0)),
            Source::Vaccinations => (date + Days::new(1)).and_time(hms(6, 0)),
        }
    }

    /// Newest date whose observation should already be published at `now`.
    pub fn latest_expected_date(&self, now: NaiveDateTime) -> NaiveDate {
        let mut date = now.date();
        while self.expected_at(date) > now {
            date = date - Days::new(1);
        }
        date
    }
}

fn hms(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, min, 0).unwrap_or(NaiveTime::MIN)
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contagions" | "contagi" | "cases" => Ok(Source::Contagions),
            "vaccinations" | "vaccini" | "vaccines" => Ok(Source::Vaccinations),
            other => Err(DigestError::Config(format!("unknown source '{other}'"))),
        }
    }
}

/// One day of figures for one (source, area).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub source: Source,
    pub area: String,
    pub date: NaiveDate,
    /// Variable name to the values reported for the day: a single value for
    /// contagions, one value per stratum (supplier, age band) for
    /// vaccinations.
    pub values: BTreeMap<String, Vec<f64>>,
}

impl Observation {
    pub fn new(source: Source, area: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            source,
            area: area.into(),
            date,
            values: BTreeMap::new(),
        }
    }

    /// Adds one value (one stratum) for `variable`.
    pub fn push(&mut self, variable: &str, value: f64) {
        self.values.entry(variable.to_string()).or_default().push(value);
    }

    pub fn with_value(mut self, variable: &str, value: f64) -> Self {
        self.push(variable, value);
        self
    }
}

#[derive(Default)]
struct Inner {
    series: HashMap<(Source, String), BTreeMap<NaiveDate, Arc<Observation>>>,
    areas: HashMap<Source, BTreeSet<String>>,
}

/// Shared observation store. Cheap to read concurrently.
#[derive(Default)]
pub struct ObservationStore {
    inner: RwLock<Inner>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation, replacing any previous one for the same date.
    pub fn record(&self, observation: Observation) {
        self.record_all(std::iter::once(observation));
    }

    /// Records a batch under a single write so readers see all of it or none.
    pub fn record_all(&self, observations: impl IntoIterator<Item = Observation>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for observation in observations {
            inner
                .series
                .entry((observation.source, observation.area.clone()))
                .or_default()
                .insert(observation.date, Arc::new(observation));
        }
    }

    /// Declares the complete list of areas `source` covers.
    ///
    /// Only call this once every dataset of the source has loaded: from then
    /// on an area outside the list is reported as untracked.
    pub fn declare_areas(&self, source: Source, areas: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.areas.entry(source).or_default().extend(areas);
    }

    /// Observations between `start` and `end` inclusive, in date order.
    pub fn range(
        &self,
        source: Source,
        area: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Arc<Observation>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .series
            .get(&(source, area.to_string()))
            .map(|days| days.range(start..=end).map(|(_, o)| o.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the area list of `source` has been declared.
    pub fn areas_known(&self, source: Source) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.areas.get(&source).is_some_and(|a| !a.is_empty())
    }

    pub fn tracks_area(&self, source: Source, area: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.areas.get(&source).is_some_and(|a| a.contains(area))
    }

    /// Areas with recorded observations for `source`, sorted.
    pub fn areas(&self, source: Source) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let areas: BTreeSet<&String> = inner
            .series
            .keys()
            .filter(|(s, _)| *s == source)
            .map(|(_, area)| area)
            .collect();
        areas.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn test_record_overwrites_by_date() {
        let store = ObservationStore::new();
        store.record(Observation::new(Source::Contagions, "Italia", date(1)).with_value("x", 1.0));
        store.record(Observation::new(Source::Contagions, "Italia", date(1)).with_value("x", 5.0));

        let got = store.range(Source::Contagions, "Italia", date(1), date(7));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].values["x"], vec![5.0]);
    }

    #[test]
    fn test_range_is_ordered_and_inclusive() {
        let store = ObservationStore::new();
        for d in [5, 1, 3, 2, 4] {
            store.record(Observation::new(Source::Contagions, "Lazio", date(d)).with_value("x", d as f64));
        }

        let dates: Vec<_> = store
            .range(Source::Contagions, "Lazio", date(2), date(4))
            .iter()
            .map(|o| o.date)
            .collect();
        assert_eq!(dates, vec![date(2), date(3), date(4)]);
    }

    #[test]
    fn test_area_tracking() {
        let store = ObservationStore::new();
        store.record(Observation::new(Source::Vaccinations, "Italia", date(1)));
        // data alone does not make the area list known
        assert!(!store.areas_known(Source::Vaccinations));
        assert!(!store.tracks_area(Source::Vaccinations, "Italia"));

        store.declare_areas(Source::Vaccinations, vec!["Lazio".to_string()]);
        assert!(store.areas_known(Source::Vaccinations));
        assert!(store.tracks_area(Source::Vaccinations, "Lazio"));
        assert!(!store.tracks_area(Source::Vaccinations, "Atlantide"));
        assert!(!store.tracks_area(Source::Contagions, "Lazio"));
    }

    #[test]
    fn test_latest_expected_date_follows_latency() {
        let morning = date(10).and_hms_opt(5, 30, 0).unwrap();
        let evening = date(10).and_hms_opt(18, 0, 0).unwrap();

        assert_eq!(Source::Contagions.latest_expected_date(morning), date(9));
        assert_eq!(Source::Contagions.latest_expected_date(evening), date(10));
        assert_eq!(Source::Vaccinations.latest_expected_date(morning), date(8));
        assert_eq!(Source::Vaccinations.latest_expected_date(evening), date(9));
    }
}

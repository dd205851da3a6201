//! Period statistics: total, mean, standard deviation and percent variation
//! against the preceding period.

use serde::Serialize;
use std::sync::Arc;

use crate::observations::Observation;
use crate::period::Granularity;

/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Computes the population standard deviation given a pre-computed mean.
/// Returns 0.0 for empty input.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    variance.sqrt()
}

/// Percent change of `current` against `previous`.
///
/// `None` when there is no previous mean or it is zero.
pub fn pct_variation(current: f64, previous: Option<f64>) -> Option<f64> {
    match previous {
        Some(p) if p != 0.0 && p.is_finite() => Some((current - p) / p * 100.0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodStats {
    pub total: f64,
    pub mean: f64,
    pub stddev: f64,
    /// `None` renders as "not applicable".
    pub pct_variation: Option<f64>,
}

/// Aggregates the values of one variable over a period.
///
/// `values` must already follow the per-granularity convention applied by
/// [`period_values`]: one value per stratum for a day period, one summed
/// value per day for week and month periods. `aggregate` itself treats
/// every slice the same way.
///
/// A single-point sequence has no spread, so its standard deviation is 0.
pub fn aggregate(values: &[f64], previous_mean: Option<f64>) -> PeriodStats {
    let total = values.iter().sum::<f64>();
    let avg = mean(values);
    let sd = if values.len() < 2 { 0.0 } else { stddev(values, avg) };

    PeriodStats {
        total,
        mean: avg,
        stddev: sd,
        pct_variation: pct_variation(avg, previous_mean),
    }
}

/// Values of `variable` to aggregate for a period, given its observations in
/// date order.
///
/// Day periods keep every stratum of the day. Week and month periods first
/// collapse each day to its sum so there is exactly one value per day.
/// Returns `None` if any day lacks the variable.
pub fn period_values(
    observations: &[Arc<Observation>],
    variable: &str,
    granularity: Granularity,
) -> Option<Vec<f64>> {
    if observations.is_empty() {
        return None;
    }

    let mut values = Vec::new();
    for observation in observations {
        let day = observation.values.get(variable).filter(|v| !v.is_empty())?;
        match granularity {
            Granularity::Day => values.extend_from_slice(day),
            Granularity::Week | Granularity::Month => values.push(day.iter().sum()),
        }
    }

    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::Source;
    use chrono::NaiveDate;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_mean_and_stddev_with_empty_input() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(stddev(&[], 0.0), 0.0);
    }

    #[test]
    fn test_stddev_is_population() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = mean(&values);
        assert!((m - 5.0).abs() < EPS);
        assert!((stddev(&values, m) - 2.0).abs() < EPS);
    }

    #[test]
    fn test_single_day_total_equals_mean() {
        let stats = aggregate(&[1234.0], Some(1000.0));
        assert_eq!(stats.total, stats.mean);
        assert_eq!(stats.stddev, 0.0);
        assert!((stats.pct_variation.unwrap() - 23.4).abs() < EPS);
    }

    #[test]
    fn test_week_total_is_mean_times_days() {
        let values = [10.0, 12.0, 9.0, 15.0, 20.0, 7.0, 11.0];
        let stats = aggregate(&values, None);
        assert!((stats.total - stats.mean * 7.0).abs() < EPS);
        assert!(stats.stddev > 0.0);
        assert_eq!(stats.pct_variation, None);
    }

    #[test]
    fn test_zero_previous_mean_is_not_applicable() {
        assert_eq!(pct_variation(10.0, Some(0.0)), None);
        assert_eq!(aggregate(&[5.0], Some(0.0)).pct_variation, None);
    }

    #[test]
    fn test_negative_variation() {
        let v = pct_variation(50.0, Some(200.0)).unwrap();
        assert!((v + 75.0).abs() < EPS);
    }

    fn obs(day: u32, values: &[f64]) -> Arc<Observation> {
        let mut o = Observation::new(
            Source::Vaccinations,
            "Italia",
            NaiveDate::from_ymd_opt(2021, 3, day).unwrap(),
        );
        for v in values {
            o.push("prima_dose", *v);
        }
        Arc::new(o)
    }

    #[test]
    fn test_stratified_day_keeps_strata() {
        let observations = vec![obs(1, &[100.0, 300.0])];
        let values = period_values(&observations, "prima_dose", Granularity::Day).unwrap();
        assert_eq!(values, vec![100.0, 300.0]);

        let stats = aggregate(&values, None);
        assert_eq!(stats.total, 400.0);
        assert_eq!(stats.mean, 200.0);
        assert!((stats.stddev - 100.0).abs() < EPS);
    }

    #[test]
    fn test_stratified_week_collapses_days() {
        let observations: Vec<_> = (1..=7).map(|d| obs(d, &[1.0, 2.0])).collect();
        let values = period_values(&observations, "prima_dose", Granularity::Week).unwrap();
        assert_eq!(values, vec![3.0; 7]);

        // same strata, but the week reports per-day figures
        let stats = aggregate(&values, None);
        assert_eq!(stats.total, 21.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.stddev, 0.0);
    }

    #[test]
    fn test_missing_variable_yields_none() {
        let observations = vec![obs(1, &[1.0]), Arc::new(Observation::new(
            Source::Vaccinations,
            "Italia",
            NaiveDate::from_ymd_opt(2021, 3, 2).unwrap(),
        ))];
        assert!(period_values(&observations, "prima_dose", Granularity::Week).is_none());
        assert!(period_values(&[], "prima_dose", Granularity::Day).is_none());
    }
}

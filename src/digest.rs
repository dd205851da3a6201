//! Composition of the combined per-period digest.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::observations::ObservationStore;
use crate::period::Period;
use crate::stats::{PeriodStats, aggregate, mean, period_values};
use crate::subscriptions::{RecipientId, Stream};

#[derive(Debug, Clone, Serialize)]
pub struct VariableReport {
    pub variable: String,
    #[serde(flatten)]
    pub stats: PeriodStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub stream: Stream,
    pub period: Period,
    pub variables: Vec<VariableReport>,
}

/// One message worth of statistics: every ready stream of a recipient for
/// one period.
#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub recipient: RecipientId,
    pub period: Period,
    pub streams: Vec<StreamReport>,
}

/// Statistics for every variable of `stream` over `period`.
///
/// A variable missing on any constituent day is left out. The variation
/// term is only computed when the previous period is complete too.
pub fn stream_report(store: &ObservationStore, stream: &Stream, period: &Period) -> StreamReport {
    let granularity = period.granularity;
    let current = store.range(stream.source, &stream.area, period.start(), period.end);

    let previous_period = period.previous();
    let previous = store.range(
        stream.source,
        &stream.area,
        previous_period.start(),
        previous_period.end,
    );
    let previous_complete = previous.len() == previous_period.num_days();

    let mut variables = Vec::new();
    if current.len() == period.num_days() {
        let names: BTreeSet<&String> = current.iter().flat_map(|o| o.values.keys()).collect();

        for name in names {
            let Some(values) = period_values(&current, name, granularity) else {
                continue;
            };
            let previous_mean = if previous_complete {
                period_values(&previous, name, granularity).map(|v| mean(&v))
            } else {
                None
            };

            variables.push(VariableReport {
                variable: name.clone(),
                stats: aggregate(&values, previous_mean),
            });
        }
    }

    StreamReport {
        stream: stream.clone(),
        period: *period,
        variables,
    }
}

pub fn compose<'a>(
    store: &ObservationStore,
    recipient: &RecipientId,
    period: &Period,
    streams: impl IntoIterator<Item = &'a Stream>,
) -> Digest {
    Digest {
        recipient: recipient.clone(),
        period: *period,
        streams: streams
            .into_iter()
            .map(|s| stream_report(store, s, period))
            .collect(),
    }
}

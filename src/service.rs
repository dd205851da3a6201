//! The long-running service: refresh datasets, then run a scheduling pass,
//! once per tick.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, TimeDelta};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::fetch::HttpClient;
use crate::observations::{Observation, ObservationStore};
use crate::scheduler::{DeliveryScheduler, TickReport};
use crate::sources::{Dataset, catalogue, covered_areas, fetch_dataset};
use crate::state::StateStore;
use crate::supervisor::Failure;
use crate::transport::TransportSink;

#[derive(Debug, Clone, Copy)]
struct Refreshed {
    at: NaiveDateTime,
    newest: Option<NaiveDate>,
}

pub struct Service {
    store: Arc<ObservationStore>,
    scheduler: DeliveryScheduler,
    client: Arc<dyn HttpClient>,
    datasets: Vec<Dataset>,
    tick_interval: Duration,
    fetch_timeout: Duration,
    refresh_interval: TimeDelta,
    refreshed: HashMap<&'static str, Refreshed>,
    /// Areas seen in each dataset's last successful load.
    areas: HashMap<&'static str, BTreeSet<String>>,
}

impl Service {
    pub fn new(
        settings: &Settings,
        state: Arc<StateStore>,
        sink: Arc<dyn TransportSink>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        let store = Arc::new(ObservationStore::new());
        Self {
            scheduler: DeliveryScheduler::new(store.clone(), state, sink, settings.scheduler),
            store,
            client,
            datasets: catalogue(),
            tick_interval: settings.tick_interval,
            fetch_timeout: settings.fetch_timeout,
            refresh_interval: TimeDelta::from_std(settings.refresh_interval)
                .unwrap_or(TimeDelta::hours(6)),
            refreshed: HashMap::new(),
            areas: HashMap::new(),
        }
    }

    pub fn with_datasets(mut self, datasets: Vec<Dataset>) -> Self {
        self.datasets = datasets;
        self
    }

    /// Whether `dataset` should be downloaded again at `now`.
    ///
    /// True when it was never loaded, when the newest loaded day is older
    /// than the day that should be published by now, or when the last
    /// download is older than the refresh interval (to pick up revisions).
    fn needs_refresh(&self, dataset: &Dataset, now: NaiveDateTime) -> bool {
        let Some(last) = self.refreshed.get(dataset.name) else {
            return true;
        };
        if now - last.at >= self.refresh_interval {
            return true;
        }
        let expected = dataset.source.latest_expected_date(now);
        last.newest.is_none_or(|newest| newest < expected)
    }

    /// Downloads every dataset that needs it, concurrently.
    ///
    /// Failures are logged and leave the previous observations in place;
    /// the dataset is retried on the next tick. Returns the number of
    /// datasets refreshed.
    pub async fn refresh(&mut self, now: NaiveDateTime) -> usize {
        let mut tasks = JoinSet::new();
        for dataset in self.datasets.iter().filter(|d| self.needs_refresh(d, now)) {
            let client = self.client.clone();
            let dataset = dataset.clone();
            let timeout = self.fetch_timeout;
            tasks.spawn(async move {
                let result = fetch_dataset(client.as_ref(), &dataset, timeout).await;
                (dataset, result)
            });
        }

        let mut refreshed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((dataset, Ok(observations))) => {
                    self.loaded(&dataset, observations, now);
                    refreshed += 1;
                }
                Ok((dataset, Err(e))) => {
                    warn!(dataset = dataset.name, error = %e, "Dataset refresh failed, keeping previous data");
                }
                Err(e) => error!(error = %e, "Dataset refresh task failed"),
            }
        }
        refreshed
    }

    /// Stores a successful download. The source's area list is declared
    /// only once all of its datasets have loaded, so a failed regional file
    /// never makes regional streams look untracked.
    fn loaded(&mut self, dataset: &Dataset, observations: Vec<Observation>, now: NaiveDateTime) {
        let newest = observations.iter().map(|o| o.date).max();
        let count = observations.len();
        let areas: BTreeSet<String> = observations.iter().map(|o| o.area.clone()).collect();

        self.store.record_all(observations);
        self.refreshed
            .insert(dataset.name, Refreshed { at: now, newest });
        self.areas.insert(dataset.name, areas);
        info!(dataset = dataset.name, observations = count, newest = ?newest, "Dataset refreshed");

        if let Some(covered) = covered_areas(&self.datasets, dataset.source, &self.areas) {
            debug!(source = %dataset.source, areas = covered.len(), "Area list complete");
            self.store.declare_areas(dataset.source, covered);
        }
    }

    /// One refresh plus one scheduling pass at `now`.
    pub async fn step(&mut self, now: NaiveDateTime) -> Result<TickReport> {
        self.refresh(now).await;
        self.scheduler
            .tick(now)
            .await
            .context("delivery state could not be persisted")
    }

    /// Runs until `shutdown` flips to true. A pass in progress completes
    /// before the service returns. A pass that cannot persist delivery state
    /// ends the run with a fatal failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Failure> {
        info!(
            datasets = self.datasets.len(),
            tick_secs = self.tick_interval.as_secs(),
            "Service started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Service stopping");
                        return Ok(());
                    }
                    continue;
                }
            }

            let now = Local::now().naive_local();
            let report = self.step(now).await.map_err(Failure::Fatal)?;
            debug!(
                transitions = report.transitions.len(),
                backing_off = report.backing_off.len(),
                "Pass finished"
            );
        }
    }
}

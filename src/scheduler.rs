//! Delivery scheduler.
//!
//! Each tick walks every subscription and moves its due periods through
//! `pending → ready → quiet-held → sent`, or `pending → not-applicable`.
//! Periods of one recipient are handled oldest first and the walk stops at
//! the first period that cannot be closed yet, so a later period is never
//! delivered before an earlier one.
//!
//! A period is closed by a write-once [`DeliveryRecord`], written only after
//! the transport acknowledged the message.

use chrono::{Days, NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{Instrument, debug, info, warn};

use crate::digest::compose;
use crate::error::{Result, SendError};
use crate::freshness::{FreshnessTracker, Readiness};
use crate::observations::ObservationStore;
use crate::output;
use crate::period::Period;
use crate::state::{Closure, DeliveryRecord, StateStore};
use crate::subscriptions::{RecipientId, Stream, SubscriptionConfig, SubscriptionRegistry};
use crate::transport::TransportSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Some subscribed stream still misses data.
    Pending,
    /// Every stream is ready; the last send attempt failed.
    Ready,
    /// Ready, but the recipient is inside quiet hours.
    QuietHeld,
    Sent,
    /// Closed without a message.
    NotApplicable,
}

/// Exponential backoff for recipients whose deliveries keep failing.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Days after a period's end before a still-pending period is given up.
    pub pending_horizon_days: u64,
    /// Most periods delivered when catching up after downtime.
    pub max_backlog: usize,
    pub send_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pending_horizon_days: 7,
            max_backlog: 3,
            send_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub recipient: RecipientId,
    pub period: Period,
    pub state: DeliveryState,
}

/// What one tick did, for logging and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub transitions: Vec<Transition>,
    /// Recipients dropped because the transport reported them unreachable.
    pub removed: Vec<RecipientId>,
    /// Recipients skipped because they are backing off.
    pub backing_off: Vec<RecipientId>,
}

impl TickReport {
    pub fn sent(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.state == DeliveryState::Sent)
            .count()
    }

    pub fn state_of(&self, recipient: &RecipientId, period: &Period) -> Option<DeliveryState> {
        self.transitions
            .iter()
            .find(|t| &t.recipient == recipient && &t.period == period)
            .map(|t| t.state)
    }
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    retry_at: NaiveDateTime,
}

enum Step {
    Settled(DeliveryState),
    RecipientGone,
}

/// Removes the recipient from the in-flight set when dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<RecipientId>>,
    recipient: RecipientId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.recipient);
    }
}

pub struct DeliveryScheduler {
    store: Arc<ObservationStore>,
    tracker: FreshnessTracker,
    registry: SubscriptionRegistry,
    state: Arc<StateStore>,
    sink: Arc<dyn TransportSink>,
    settings: SchedulerSettings,
    failures: Mutex<HashMap<RecipientId, Failures>>,
    in_flight: Mutex<HashSet<RecipientId>>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<ObservationStore>,
        state: Arc<StateStore>,
        sink: Arc<dyn TransportSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            tracker: FreshnessTracker::new(store.clone()),
            registry: SubscriptionRegistry::new(state.clone()),
            store,
            state,
            sink,
            settings,
            failures: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one scheduling pass at local time `now`.
    ///
    /// Subscriptions are re-read from the state file first, so changes made
    /// by the subscription commands take effect on the next pass.
    ///
    /// Only persisted-state failures are returned; everything else is
    /// logged and retried on a later tick.
    #[tracing::instrument(skip(self, now), fields(now = %now))]
    pub async fn tick(&self, now: NaiveDateTime) -> Result<TickReport> {
        self.state.reload()?;
        let mut report = TickReport::default();

        for config in self.registry.list() {
            let span = tracing::info_span!("recipient", recipient = %config.recipient);
            self.process_recipient(&config, now, &mut report)
                .instrument(span)
                .await?;
        }

        if !report.transitions.is_empty() {
            info!(
                transitions = report.transitions.len(),
                sent = report.sent(),
                removed = report.removed.len(),
                "Tick complete"
            );
        }
        Ok(report)
    }

    fn claim(&self, recipient: &RecipientId) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(recipient.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            recipient: recipient.clone(),
        })
    }

    fn retry_at(&self, recipient: &RecipientId) -> Option<NaiveDateTime> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.get(recipient).map(|f| f.retry_at)
    }

    fn record_failure(&self, recipient: &RecipientId, now: NaiveDateTime) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.get(recipient).map_or(0, |f| f.count) + 1;
        let delay = self.settings.backoff.delay(count);
        let retry_at = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::hours(6));
        failures.insert(recipient.clone(), Failures { count, retry_at });
        count
    }

    fn clear_failures(&self, recipient: &RecipientId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(recipient);
    }

    /// Periods to consider for `config` at `today`, oldest first: from the
    /// one after the last closed period up to the latest due one, limited
    /// to the configured backlog.
    pub fn due_periods(&self, config: &SubscriptionConfig, today: chrono::NaiveDate) -> Vec<Period> {
        let granularity = config.frequency;
        let latest = Period::latest_due(today, granularity);
        let first_allowed = Period::latest_due(config.subscribed_on, granularity);

        let mut start = self
            .state
            .last_closed(&config.recipient, granularity)
            .map(|p| p.next())
            .unwrap_or(first_allowed);
        if start.end < first_allowed.end {
            start = first_allowed;
        }

        let mut floor = latest;
        for _ in 1..self.settings.max_backlog.max(1) {
            floor = floor.previous();
        }
        if start.end < floor.end {
            warn!(
                from = %start,
                to = %floor.previous(),
                "Backlog too long, skipping older periods"
            );
            start = floor;
        }

        let mut periods = Vec::new();
        let mut period = start;
        while period.end <= latest.end {
            periods.push(period);
            period = period.next();
        }
        periods
    }

    async fn process_recipient(
        &self,
        config: &SubscriptionConfig,
        now: NaiveDateTime,
        report: &mut TickReport,
    ) -> Result<()> {
        let recipient = &config.recipient;

        let Some(_claim) = self.claim(recipient) else {
            debug!("Recipient already being processed");
            return Ok(());
        };

        if let Some(retry_at) = self.retry_at(recipient) {
            if retry_at > now {
                debug!(retry_at = %retry_at, "Backing off after failed deliveries");
                report.backing_off.push(recipient.clone());
                return Ok(());
            }
        }

        for period in self.due_periods(config, now.date()) {
            // A concurrent tick may have closed it meanwhile.
            if self.state.is_closed(recipient, &period) {
                continue;
            }

            let step = self.advance(config, &period, now).await?;
            let state = match step {
                Step::Settled(state) => state,
                Step::RecipientGone => {
                    report.removed.push(recipient.clone());
                    return Ok(());
                }
            };

            report.transitions.push(Transition {
                recipient: recipient.clone(),
                period,
                state,
            });

            if !matches!(state, DeliveryState::Sent | DeliveryState::NotApplicable) {
                break;
            }
        }

        Ok(())
    }

    fn close_not_applicable(
        &self,
        config: &SubscriptionConfig,
        period: &Period,
        now: NaiveDateTime,
        reason: &str,
    ) -> Result<()> {
        info!(period = %period, reason, "Period closed without a digest");
        self.state.record(DeliveryRecord {
            recipient: config.recipient.clone(),
            signature: config.signature(),
            period: *period,
            closed_at: now,
            closure: Closure::NotApplicable {
                reason: reason.to_string(),
            },
        })?;
        Ok(())
    }

    #[tracing::instrument(skip(self, config, period, now), fields(period = %period))]
    async fn advance(
        &self,
        config: &SubscriptionConfig,
        period: &Period,
        now: NaiveDateTime,
    ) -> Result<Step> {
        let today = now.date();
        let mut ready: Vec<&Stream> = Vec::new();
        let mut pending: Vec<&Stream> = Vec::new();

        for stream in &config.streams {
            match self
                .tracker
                .readiness(stream.source, &stream.area, period, today)
            {
                Readiness::Ready => ready.push(stream),
                Readiness::Pending => pending.push(stream),
                Readiness::NotApplicable(absence) => {
                    debug!(stream = %stream, ?absence, "Stream not applicable");
                }
            }
        }

        if !pending.is_empty() {
            let horizon = period.end + Days::new(self.settings.pending_horizon_days);
            if today > horizon {
                self.close_not_applicable(config, period, now, "data_never_arrived")?;
                return Ok(Step::Settled(DeliveryState::NotApplicable));
            }
            debug!(waiting = pending.len(), ready = ready.len(), "Waiting for data");
            return Ok(Step::Settled(DeliveryState::Pending));
        }

        if ready.is_empty() {
            self.close_not_applicable(config, period, now, "no_applicable_stream")?;
            return Ok(Step::Settled(DeliveryState::NotApplicable));
        }

        if config.quiet_hours.contains(now.time()) {
            debug!(quiet_hours = %config.quiet_hours, "Digest ready, holding for quiet hours");
            return Ok(Step::Settled(DeliveryState::QuietHeld));
        }

        let digest = compose(&self.store, &config.recipient, period, ready.iter().copied());
        if digest.streams.iter().all(|s| s.variables.is_empty()) {
            self.close_not_applicable(config, period, now, "no_statistics")?;
            return Ok(Step::Settled(DeliveryState::NotApplicable));
        }
        let payload = output::render(&digest);

        let timeout = self.settings.send_timeout;
        let sent = match tokio::time::timeout(timeout, self.sink.send(&config.recipient, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout.as_secs())),
        };

        match sent {
            Ok(()) => {
                self.clear_failures(&config.recipient);
                self.state.record(DeliveryRecord {
                    recipient: config.recipient.clone(),
                    signature: config.signature(),
                    period: *period,
                    closed_at: now,
                    closure: Closure::Sent,
                })?;
                info!(streams = digest.streams.len(), "Digest delivered");
                Ok(Step::Settled(DeliveryState::Sent))
            }
            Err(SendError::RecipientGone(reason)) => {
                warn!(reason = %reason, "Recipient unreachable, removing subscription");
                self.clear_failures(&config.recipient);
                self.registry.remove(&config.recipient)?;
                Ok(Step::RecipientGone)
            }
            Err(e) => {
                let failures = self.record_failure(&config.recipient, now);
                warn!(error = %e, failures, "Digest delivery failed, will retry");
                Ok(Step::Settled(DeliveryState::Ready))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::{Observation, Source};
    use crate::period::Granularity;
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(600),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(120));
        assert_eq!(policy.delay(4), Duration::from_secs(480));
        assert_eq!(policy.delay(5), Duration::from_secs(600));
        assert_eq!(policy.delay(200), Duration::from_secs(600));
    }

    fn scheduler(max_backlog: usize) -> DeliveryScheduler {
        let store = Arc::new(ObservationStore::new());
        store.record(Observation::new(Source::Contagions, "Italia", date(1)));
        DeliveryScheduler::new(
            store,
            Arc::new(StateStore::in_memory()),
            Arc::new(crate::transport::LogSink),
            SchedulerSettings {
                max_backlog,
                ..SchedulerSettings::default()
            },
        )
    }

    fn weekly(subscribed_on: NaiveDate) -> SubscriptionConfig {
        SubscriptionConfig::new(RecipientId::new("1"), Granularity::Week, subscribed_on)
            .with_stream(Stream::new(Source::Contagions, "Italia"))
    }

    #[test]
    fn test_new_subscriber_gets_latest_due_period() {
        let s = scheduler(3);
        // subscribed and checked on Wednesday 2021-03-10
        let periods = s.due_periods(&weekly(date(10)), date(10));
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].end, date(7));
    }

    #[test]
    fn test_due_periods_resume_after_last_closed() {
        let s = scheduler(10);
        let config = weekly(date(1));
        s.state
            .record(DeliveryRecord {
                recipient: config.recipient.clone(),
                signature: config.signature(),
                period: Period::containing(date(7), Granularity::Week),
                closed_at: date(8).and_hms_opt(10, 0, 0).unwrap(),
                closure: Closure::Sent,
            })
            .unwrap();

        let ends: Vec<_> = s
            .due_periods(&config, date(29))
            .into_iter()
            .map(|p| p.end)
            .collect();
        assert_eq!(ends, vec![date(14), date(21), date(28)]);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let s = scheduler(2);
        let config = SubscriptionConfig::new(RecipientId::new("1"), Granularity::Day, date(1))
            .with_stream(Stream::new(Source::Contagions, "Italia"));
        let ends: Vec<_> = s
            .due_periods(&config, date(20))
            .into_iter()
            .map(|p| p.end)
            .collect();
        assert_eq!(ends, vec![date(19), date(20)]);
    }
}

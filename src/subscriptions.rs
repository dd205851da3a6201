//! Recipient subscriptions and the registry that serves them.
//!
//! Configurations are produced elsewhere (CLI, intent classifier) and handed
//! over whole. The registry never edits a stored record in place.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{DigestError, Result};
use crate::observations::Source;
use crate::period::Granularity;
use crate::state::StateStore;

/// Transport-level recipient identifier (a chat id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (domain, area) pair a recipient wants reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stream {
    pub source: Source,
    pub area: String,
}

impl Stream {
    pub fn new(source: Source, area: impl Into<String>) -> Self {
        Self {
            source,
            area: area.into(),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.area)
    }
}

/// Parses `source:area` or `source/area`.
impl FromStr for Stream {
    type Err = DigestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (source, area) = s
            .split_once([':', '/'])
            .ok_or_else(|| DigestError::Config(format!("stream '{s}' is not source:area")))?;
        let area = area.trim();
        if area.is_empty() {
            return Err(DigestError::Config(format!("stream '{s}' has no area")));
        }
        Ok(Self::new(source.parse()?, area))
    }
}

/// Local time window during which nothing is sent. Wraps past midnight
/// when `start > end`; an empty window when `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl fmt::Display for QuietHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Parses `HH:MM-HH:MM`.
impl FromStr for QuietHours {
    type Err = DigestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| DigestError::Config(format!("quiet hours '{s}' are not HH:MM-HH:MM")))?;
        let parse = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|e| DigestError::Config(format!("invalid time '{t}': {e}")))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub recipient: RecipientId,
    pub frequency: Granularity,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    pub streams: BTreeSet<Stream>,
    /// First day the recipient asked for reports; no earlier period is sent.
    pub subscribed_on: NaiveDate,
}

impl SubscriptionConfig {
    pub fn new(recipient: RecipientId, frequency: Granularity, subscribed_on: NaiveDate) -> Self {
        Self {
            recipient,
            frequency,
            quiet_hours: QuietHours::default(),
            streams: BTreeSet::new(),
            subscribed_on,
        }
    }

    pub fn with_stream(mut self, stream: Stream) -> Self {
        self.streams.insert(stream);
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = quiet_hours;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.recipient.as_str().trim().is_empty() {
            return Err(DigestError::Config("recipient id is empty".into()));
        }
        if self.streams.is_empty() {
            return Err(DigestError::Config(format!(
                "subscription for {} has no streams",
                self.recipient
            )));
        }
        Ok(())
    }

    /// Stable identifier of the stream set, recorded with each delivery.
    pub fn signature(&self) -> String {
        self.streams
            .iter()
            .map(Stream::to_string)
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Read-mostly registry of subscriptions, persisted through [`StateStore`].
#[derive(Clone)]
pub struct SubscriptionRegistry {
    state: Arc<StateStore>,
}

impl SubscriptionRegistry {
    pub fn new(state: Arc<StateStore>) -> Self {
        Self { state }
    }

    pub fn get(&self, recipient: &RecipientId) -> Option<SubscriptionConfig> {
        self.state.subscription(recipient)
    }

    /// Validates and stores `config`, replacing any previous record.
    pub fn put(&self, config: SubscriptionConfig) -> Result<()> {
        config.validate()?;
        self.state.put_subscription(config)
    }

    /// Returns whether a subscription existed.
    pub fn remove(&self, recipient: &RecipientId) -> Result<bool> {
        self.state.remove_subscription(recipient)
    }

    pub fn list(&self) -> Vec<SubscriptionConfig> {
        self.state.subscriptions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_default_quiet_hours_wrap_midnight() {
        let q = QuietHours::default();
        assert!(q.contains(t(21, 0)));
        assert!(q.contains(t(23, 59)));
        assert!(q.contains(t(5, 30)));
        assert!(q.contains(t(9, 59)));
        assert!(!q.contains(t(10, 0)));
        assert!(!q.contains(t(18, 0)));
        assert!(!q.contains(t(20, 59)));
    }

    #[test]
    fn test_daytime_quiet_hours() {
        let q: QuietHours = "13:00-15:00".parse().unwrap();
        assert!(q.contains(t(14, 0)));
        assert!(!q.contains(t(15, 0)));
        assert!(!q.contains(t(12, 59)));
        assert_eq!(q.to_string(), "13:00-15:00");
    }

    #[test]
    fn test_empty_quiet_window() {
        let q = QuietHours::new(t(8, 0), t(8, 0));
        assert!(!q.contains(t(8, 0)));
        assert!(!q.contains(t(20, 0)));
    }

    #[test]
    fn test_stream_parsing() {
        let s: Stream = "vaccinations:Lazio".parse().unwrap();
        assert_eq!(s, Stream::new(Source::Vaccinations, "Lazio"));
        let s: Stream = "contagi/Italia".parse().unwrap();
        assert_eq!(s.to_string(), "contagions/Italia");
        assert!("contagions".parse::<Stream>().is_err());
        assert!("weather:Lazio".parse::<Stream>().is_err());
    }

    #[test]
    fn test_validate_requires_streams() {
        let today = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();
        let config = SubscriptionConfig::new(RecipientId::new("42"), Granularity::Week, today);
        assert!(config.validate().is_err());

        let config = config.with_stream(Stream::new(Source::Contagions, "Italia"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_signature_is_order_independent() {
        let today = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();
        let a = SubscriptionConfig::new(RecipientId::new("1"), Granularity::Day, today)
            .with_stream(Stream::new(Source::Vaccinations, "Lazio"))
            .with_stream(Stream::new(Source::Contagions, "Italia"));
        let b = SubscriptionConfig::new(RecipientId::new("1"), Granularity::Day, today)
            .with_stream(Stream::new(Source::Contagions, "Italia"))
            .with_stream(Stream::new(Source::Vaccinations, "Lazio"));
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature(), "contagions/Italia+vaccinations/Lazio");
    }

    #[test]
    fn test_registry_replaces_whole_record() {
        let registry = SubscriptionRegistry::new(Arc::new(StateStore::in_memory()));
        let today = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();
        let id = RecipientId::new("7");

        let first = SubscriptionConfig::new(id.clone(), Granularity::Day, today)
            .with_stream(Stream::new(Source::Contagions, "Italia"));
        registry.put(first).unwrap();

        let second = SubscriptionConfig::new(id.clone(), Granularity::Month, today)
            .with_stream(Stream::new(Source::Vaccinations, "Lazio"));
        registry.put(second.clone()).unwrap();

        assert_eq!(registry.get(&id), Some(second));
        assert!(registry.remove(&id).unwrap());
        assert!(!registry.remove(&id).unwrap());
        assert_eq!(registry.get(&id), None);
    }

    #[test]
    fn test_registry_rejects_invalid_config() {
        let registry = SubscriptionRegistry::new(Arc::new(StateStore::in_memory()));
        let today = NaiveDate::from_ymd_opt(2021, 3, 1).unwrap();
        let config = SubscriptionConfig::new(RecipientId::new("7"), Granularity::Day, today);
        assert!(registry.put(config).is_err());
        assert!(registry.list().is_empty());
    }
}

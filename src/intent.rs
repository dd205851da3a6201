//! Keyword-based classification of free-text configuration requests.
//!
//! Recognises Italian and English keywords for frequencies, domains and
//! areas. Anything that names no known keyword is `Unrecognized`.

use chrono::NaiveDate;

use crate::error::Result;
use crate::observations::{NATIONAL_AREA, Source};
use crate::period::Granularity;
use crate::subscriptions::{QuietHours, RecipientId, Stream, SubscriptionConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SetFrequency(Granularity),
    AddStream(Stream),
    RemoveStream(Stream),
    SetQuietHours(QuietHours),
    Disable,
    Status,
    Unrecognized,
}

const DISABLE: &[&str] = &["disattiva", "disiscrivi", "annulla iscrizione", "unsubscribe", "stop"];
const STATUS: &[&str] = &["stato", "impostazioni", "status", "settings"];
const REMOVE: &[&str] = &["senza", "togli", "rimuovi", "non voglio", "without", "remove"];

const FREQUENCIES: &[(&str, Granularity)] = &[
    ("giornalier", Granularity::Day),
    ("ogni giorno", Granularity::Day),
    ("daily", Granularity::Day),
    ("settiman", Granularity::Week),
    ("weekly", Granularity::Week),
    ("mensil", Granularity::Month),
    ("ogni mese", Granularity::Month),
    ("monthly", Granularity::Month),
];

const SOURCES: &[(&str, Source)] = &[
    ("contag", Source::Contagions),
    ("positiv", Source::Contagions),
    ("cases", Source::Contagions),
    ("vaccin", Source::Vaccinations),
];

const NATIONAL: &[&str] = &["italia", "italy", "nazional", "national"];

fn mentions(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Maps `text` to intents. `known_areas` are the area names the sources
/// track; matching is case-insensitive.
///
/// Domains named without an area refer to the national stream.
pub fn classify(text: &str, known_areas: &[String]) -> Vec<Intent> {
    let text = text.to_lowercase();

    if mentions(&text, DISABLE) {
        return vec![Intent::Disable];
    }

    let mut intents = Vec::new();

    if let Some(&(_, granularity)) = FREQUENCIES.iter().find(|(k, _)| text.contains(k)) {
        intents.push(Intent::SetFrequency(granularity));
    }

    let mut sources: Vec<Source> = Vec::new();
    for &(keyword, source) in SOURCES {
        if text.contains(keyword) && !sources.contains(&source) {
            sources.push(source);
        }
    }

    let mut areas: Vec<String> = known_areas
        .iter()
        .filter(|a| a.as_str() != NATIONAL_AREA && text.contains(&a.to_lowercase()))
        .cloned()
        .collect();
    if mentions(&text, NATIONAL) || (areas.is_empty() && !sources.is_empty()) {
        areas.insert(0, NATIONAL_AREA.to_string());
    }

    let removing = mentions(&text, REMOVE);
    for &source in &sources {
        for area in &areas {
            let stream = Stream::new(source, area.clone());
            intents.push(if removing {
                Intent::RemoveStream(stream)
            } else {
                Intent::AddStream(stream)
            });
        }
    }

    if let Some(quiet) = text
        .split_whitespace()
        .find_map(|word| word.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
    {
        intents.push(Intent::SetQuietHours(quiet));
    }

    if intents.is_empty() && mentions(&text, STATUS) {
        intents.push(Intent::Status);
    }
    if intents.is_empty() {
        intents.push(Intent::Unrecognized);
    }
    intents
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The validated configuration to store.
    Updated(SubscriptionConfig),
    Disable,
    Status,
    Unrecognized,
}

/// Folds `intents` into the recipient's configuration.
///
/// A recipient without a configuration gets a weekly one subscribed from
/// `today`. Changing the frequency also restarts the subscription at
/// `today`, so no backlog of the new granularity is delivered.
pub fn apply(
    intents: &[Intent],
    current: Option<&SubscriptionConfig>,
    recipient: &RecipientId,
    today: NaiveDate,
    quiet_hours: QuietHours,
) -> Result<Outcome> {
    if intents.contains(&Intent::Disable) {
        return Ok(Outcome::Disable);
    }
    if intents.iter().all(|i| *i == Intent::Unrecognized) {
        return Ok(Outcome::Unrecognized);
    }
    if intents.iter().all(|i| matches!(i, Intent::Status | Intent::Unrecognized)) {
        return Ok(Outcome::Status);
    }

    let mut config = current.cloned().unwrap_or_else(|| {
        SubscriptionConfig::new(recipient.clone(), Granularity::Week, today)
            .with_quiet_hours(quiet_hours)
    });

    for intent in intents {
        match intent {
            Intent::SetFrequency(g) if *g != config.frequency => {
                config.frequency = *g;
                config.subscribed_on = today;
            }
            Intent::AddStream(stream) => {
                config.streams.insert(stream.clone());
            }
            Intent::RemoveStream(stream) => {
                config.streams.remove(stream);
            }
            Intent::SetQuietHours(q) => config.quiet_hours = *q,
            _ => {}
        }
    }

    config.validate()?;
    Ok(Outcome::Updated(config))
}

//! Dataset catalogue and CSV ingest.
//!
//! Turns the published CSV files into daily [`Observation`]s. Cumulative
//! counters are converted into daily values; rows sharing a (date, area)
//! are kept as strata.

use chrono::{Days, NaiveDate};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DigestError, Result};
use crate::fetch::{HttpClient, fetch_bytes};
use crate::observations::{NATIONAL_AREA, Observation, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// The value describes the day itself.
    Actual,
    /// A running total; the day's value is the difference from the day before.
    Cumulative,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: &'static str,
    pub source: Source,
    pub url: String,
    /// Column holding the area name. `None` for national-only files.
    pub area_column: Option<&'static str>,
    /// Every row also counts as a stratum of the national stream.
    pub national_rollup: bool,
    /// Accepted date columns, first match wins.
    pub date_columns: &'static [&'static str],
    pub variables: &'static [(&'static str, VariableKind)],
}

const CONTAGIONS_BASE: &str = "https://raw.githubusercontent.com/pcm-dpc/COVID-19/master";
const VACCINATIONS_BASE: &str =
    "https://raw.githubusercontent.com/italia/covid19-opendata-vaccini/master";

static CONTAGION_VARIABLES: &[(&str, VariableKind)] = &[
    ("nuovi_positivi", VariableKind::Actual),
    ("totale_positivi", VariableKind::Actual),
    ("ricoverati_con_sintomi", VariableKind::Actual),
    ("terapia_intensiva", VariableKind::Actual),
    ("isolamento_domiciliare", VariableKind::Actual),
    ("dimessi_guariti", VariableKind::Cumulative),
    ("deceduti", VariableKind::Cumulative),
    ("tamponi", VariableKind::Cumulative),
    ("tamponi_test_molecolare", VariableKind::Cumulative),
    ("tamponi_test_antigenico_rapido", VariableKind::Cumulative),
];

static VACCINATION_VARIABLES: &[(&str, VariableKind)] = &[
    ("prima_dose", VariableKind::Actual),
    ("seconda_dose", VariableKind::Actual),
    ("pregressa_infezione", VariableKind::Actual),
    ("dose_addizionale_booster", VariableKind::Actual),
];

/// The published datasets the service follows.
pub fn catalogue() -> Vec<Dataset> {
    vec![
        Dataset {
            name: "contagions_national",
            source: Source::Contagions,
            url: format!(
                "{CONTAGIONS_BASE}/dati-andamento-nazionale/dpc-covid19-ita-andamento-nazionale.csv"
            ),
            area_column: None,
            national_rollup: false,
            date_columns: &["data"],
            variables: CONTAGION_VARIABLES,
        },
        Dataset {
            name: "contagions_regional",
            source: Source::Contagions,
            url: format!("{CONTAGIONS_BASE}/dati-regioni/dpc-covid19-ita-regioni.csv"),
            area_column: Some("denominazione_regione"),
            national_rollup: false,
            date_columns: &["data"],
            variables: CONTAGION_VARIABLES,
        },
        Dataset {
            name: "vaccinations_doses",
            source: Source::Vaccinations,
            url: format!("{VACCINATIONS_BASE}/dati/somministrazioni-vaccini-latest.csv"),
            area_column: Some("nome_area"),
            national_rollup: true,
            date_columns: &["data_somministrazione", "data"],
            variables: VACCINATION_VARIABLES,
        },
    ]
}

/// Parses a date from `2021-03-01` or `2021-03-01T17:00:00`.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

type Strata = BTreeMap<String, Vec<f64>>;

/// Parses one dataset into observations, one per (area, date).
pub fn parse_dataset(dataset: &Dataset, bytes: &[u8]) -> Result<Vec<Observation>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = rdr
        .headers()
        .map_err(|e| DigestError::Source(format!("{}: unreadable header: {e}", dataset.name)))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);

    let date_idx = dataset
        .date_columns
        .iter()
        .find_map(|c| column(*c))
        .ok_or_else(|| DigestError::Source(format!("{}: no date column", dataset.name)))?;

    let area_idx = match dataset.area_column {
        Some(name) => Some(column(name).ok_or_else(|| {
            DigestError::Source(format!("{}: missing area column '{name}'", dataset.name))
        })?),
        None => None,
    };

    let mut variables = Vec::new();
    for (name, kind) in dataset.variables {
        match column(*name) {
            Some(idx) => variables.push((*name, *kind, idx)),
            None => warn!(dataset = dataset.name, variable = name, "Variable missing from dataset, ignoring it"),
        }
    }

    let mut days: BTreeMap<(String, NaiveDate), Strata> = BTreeMap::new();
    let mut skipped_rows = 0usize;

    for record in rdr.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                skipped_rows += 1;
                debug!(dataset = dataset.name, error = %e, "Skipping malformed row");
                continue;
            }
        };

        let Some(date) = record.get(date_idx).and_then(parse_date) else {
            skipped_rows += 1;
            continue;
        };

        let area = match area_idx {
            Some(idx) => match record.get(idx).map(str::trim) {
                Some(a) if !a.is_empty() => a.to_string(),
                _ => {
                    skipped_rows += 1;
                    continue;
                }
            },
            None => NATIONAL_AREA.to_string(),
        };

        let mut targets = vec![area];
        if dataset.national_rollup && targets[0] != NATIONAL_AREA {
            targets.push(NATIONAL_AREA.to_string());
        }

        for target in targets {
            let strata = days.entry((target, date)).or_default();
            for (name, _, idx) in &variables {
                let raw = record.get(*idx).unwrap_or("").trim();
                if raw.is_empty() {
                    continue;
                }
                match raw.parse::<f64>() {
                    Ok(v) if v.is_finite() => strata.entry(name.to_string()).or_default().push(v),
                    _ => debug!(dataset = dataset.name, variable = name, value = raw, "Skipping non-numeric value"),
                }
            }
        }
    }

    if skipped_rows > 0 {
        warn!(dataset = dataset.name, skipped_rows, "Rows without usable date or area");
    }

    let cumulative: Vec<&str> = variables
        .iter()
        .filter(|(_, kind, _)| *kind == VariableKind::Cumulative)
        .map(|(name, _, _)| *name)
        .collect();
    let days = to_daily(days, &cumulative);

    Ok(days
        .into_iter()
        .map(|((area, date), values)| Observation {
            source: dataset.source,
            area,
            date,
            values,
        })
        .collect())
}

/// Replaces running totals by the difference from the previous calendar
/// day. Without a previous day the variable is dropped for that date.
fn to_daily(
    days: BTreeMap<(String, NaiveDate), Strata>,
    cumulative: &[&str],
) -> BTreeMap<(String, NaiveDate), Strata> {
    if cumulative.is_empty() {
        return days;
    }

    let totals: HashMap<(String, NaiveDate, &str), f64> = days
        .iter()
        .flat_map(|((area, date), strata)| {
            cumulative.iter().filter_map(move |var| {
                strata
                    .get(*var)
                    .map(|v| ((area.clone(), *date, *var), v.iter().sum::<f64>()))
            })
        })
        .collect();

    days.into_iter()
        .map(|((area, date), mut strata)| {
            for var in cumulative {
                let today = totals.get(&(area.clone(), date, *var));
                let yesterday = date
                    .checked_sub_days(Days::new(1))
                    .and_then(|prev| totals.get(&(area.clone(), prev, *var)));

                match (today, yesterday) {
                    (Some(t), Some(y)) => {
                        strata.insert(var.to_string(), vec![t - y]);
                    }
                    _ => {
                        strata.remove(*var);
                    }
                }
            }
            ((area, date), strata)
        })
        .collect()
}

/// Areas `source` covers, once every dataset of that source has loaded.
///
/// `loaded` maps dataset names to the areas found in their last successful
/// load. `None` while any dataset of the source is missing, or when the
/// catalogue has none.
pub fn covered_areas(
    datasets: &[Dataset],
    source: Source,
    loaded: &HashMap<&'static str, BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    let mut areas = BTreeSet::new();
    let mut any = false;
    for dataset in datasets.iter().filter(|d| d.source == source) {
        areas.extend(loaded.get(dataset.name)?.iter().cloned());
        any = true;
    }
    any.then_some(areas)
}

/// Downloads and parses a dataset, bounded by `timeout`.
#[tracing::instrument(skip(client, dataset), fields(dataset = dataset.name))]
pub async fn fetch_dataset<C: HttpClient + ?Sized>(
    client: &C,
    dataset: &Dataset,
    timeout: Duration,
) -> Result<Vec<Observation>> {
    let bytes = tokio::time::timeout(timeout, fetch_bytes(client, &dataset.url))
        .await
        .map_err(|_| {
            DigestError::Source(format!(
                "{}: fetch timed out after {}s",
                dataset.name,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| DigestError::Source(format!("{}: {e}", dataset.name)))?;

    debug!(bytes = bytes.len(), "Dataset downloaded, parsing");
    parse_dataset(dataset, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str) -> Dataset {
        catalogue().into_iter().find(|d| d.name == name).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn test_national_contagions_convert_cumulative_counters() {
        let csv = "data,stato,nuovi_positivi,deceduti,tamponi\n\
                   2021-03-01T17:00:00,ITA,100,1000,5000\n\
                   2021-03-02T17:00:00,ITA,150,1010,5600\n";
        let obs = parse_dataset(&dataset("contagions_national"), csv.as_bytes()).unwrap();

        assert_eq!(obs.len(), 2);
        assert!(obs.iter().all(|o| o.area == NATIONAL_AREA));

        let first = &obs[0];
        assert_eq!(first.date, date(1));
        assert_eq!(first.values["nuovi_positivi"], vec![100.0]);
        assert!(!first.values.contains_key("deceduti"));

        let second = &obs[1];
        assert_eq!(second.values["deceduti"], vec![10.0]);
        assert_eq!(second.values["tamponi"], vec![600.0]);
    }

    #[test]
    fn test_regional_contagions_are_split_by_area() {
        let csv = "data,denominazione_regione,nuovi_positivi\n\
                   2021-03-01T17:00:00,Lazio,10\n\
                   2021-03-01T17:00:00,Umbria,3\n";
        let obs = parse_dataset(&dataset("contagions_regional"), csv.as_bytes()).unwrap();
        let areas: Vec<_> = obs.iter().map(|o| o.area.as_str()).collect();
        assert_eq!(areas, vec!["Lazio", "Umbria"]);
    }

    #[test]
    fn test_vaccination_rows_are_strata_and_roll_up() {
        let csv = "data_somministrazione,fornitore,area,fascia_anagrafica,prima_dose,seconda_dose,nome_area\n\
                   2021-03-01,Pfizer,LAZ,20-29,100,50,Lazio\n\
                   2021-03-01,Moderna,LAZ,20-29,300,0,Lazio\n\
                   2021-03-01,Pfizer,UMB,20-29,20,10,Umbria\n";
        let obs = parse_dataset(&dataset("vaccinations_doses"), csv.as_bytes()).unwrap();

        let lazio = obs.iter().find(|o| o.area == "Lazio").unwrap();
        assert_eq!(lazio.values["prima_dose"], vec![100.0, 300.0]);

        let italia = obs.iter().find(|o| o.area == NATIONAL_AREA).unwrap();
        assert_eq!(italia.values["prima_dose"].len(), 3);
        assert_eq!(italia.values["seconda_dose"].iter().sum::<f64>(), 60.0);
    }

    #[test]
    fn test_bad_cells_and_rows_are_skipped() {
        let csv = "data,denominazione_regione,nuovi_positivi\n\
                   not-a-date,Lazio,10\n\
                   2021-03-01T17:00:00,,10\n\
                   2021-03-02T17:00:00,Lazio,abc\n";
        let obs = parse_dataset(&dataset("contagions_regional"), csv.as_bytes()).unwrap();
        assert_eq!(obs.len(), 1);
        assert!(obs[0].values.is_empty());
    }

    #[test]
    fn test_missing_date_column_is_a_source_error() {
        let csv = "giorno,nuovi_positivi\n2021-03-01,1\n";
        let err = parse_dataset(&dataset("contagions_national"), csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DigestError::Source(_)));
    }

    #[test]
    fn test_areas_covered_only_when_every_dataset_loaded() {
        let datasets = catalogue();
        let mut loaded = HashMap::new();
        loaded.insert("contagions_national", BTreeSet::from(["Italia".to_string()]));

        // the regional file has not loaded yet
        assert_eq!(covered_areas(&datasets, Source::Contagions, &loaded), None);

        loaded.insert(
            "contagions_regional",
            BTreeSet::from(["Lazio".to_string(), "Umbria".to_string()]),
        );
        let areas = covered_areas(&datasets, Source::Contagions, &loaded).unwrap();
        assert_eq!(areas.len(), 3);
        assert!(areas.contains("Lazio"));

        assert_eq!(covered_areas(&datasets, Source::Vaccinations, &loaded), None);
    }
}

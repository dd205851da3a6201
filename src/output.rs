//! Output formatting for digests.
//!
//! Supports plain-text rendering for the transport, pretty-printing and
//! JSON serialization for previews.

use anyhow::Result;
use tracing::{debug, info};

use crate::digest::{Digest, StreamReport};
use crate::observations::Source;

/// Logs a digest using Rust's debug pretty-print format.
pub fn print_pretty(digest: &Digest) {
    debug!("{:#?}", digest);
}

/// Logs a digest as pretty-printed JSON.
pub fn print_json(digest: &Digest) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(digest)?);
    Ok(())
}

fn domain_label(source: Source) -> &'static str {
    match source {
        Source::Contagions => "contagi",
        Source::Vaccinations => "vaccini",
    }
}

fn humanize(variable: &str) -> String {
    variable.replace('_', " ")
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.1}")
    }
}

fn render_stream(report: &StreamReport) -> String {
    let mut s = format!(
        "Report {} {} {}\n",
        domain_label(report.stream.source),
        report.stream.area,
        report.period.label()
    );
    s.push_str(&"-".repeat(40));
    s.push('\n');

    for v in &report.variables {
        let name = humanize(&v.variable);
        let variation = match v.stats.pct_variation {
            Some(p) => format!("{p:.1}%"),
            None => "n/a".to_string(),
        };

        for (label, value) in [
            ("Totale", format_value(v.stats.total)),
            ("Media", format_value(v.stats.mean)),
            ("Dev std", format_value(v.stats.stddev)),
            ("Var pct", variation),
        ] {
            s.push_str(&format!("{label} {name}\n{value}\n"));
        }
    }

    s
}

/// Renders a digest as the plain-text message body, one block per stream.
pub fn render(digest: &Digest) -> String {
    digest
        .streams
        .iter()
        .map(render_stream)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::VariableReport;
    use crate::period::{Granularity, Period};
    use crate::stats::PeriodStats;
    use crate::subscriptions::{RecipientId, Stream};
    use chrono::NaiveDate;

    fn digest() -> Digest {
        let period = Period::containing(NaiveDate::from_ymd_opt(2021, 3, 10).unwrap(), Granularity::Week);
        Digest {
            recipient: RecipientId::new("1"),
            period,
            streams: vec![StreamReport {
                stream: Stream::new(Source::Contagions, "Italia"),
                period,
                variables: vec![VariableReport {
                    variable: "nuovi_positivi".into(),
                    stats: PeriodStats {
                        total: 700.0,
                        mean: 100.0,
                        stddev: 12.345,
                        pct_variation: None,
                    },
                }],
            }],
        }
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&digest());
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&digest()).unwrap();
    }

    #[test]
    fn test_render_layout() {
        let text = render(&digest());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Report contagi Italia 2021-W10");
        assert_eq!(lines[1], "-".repeat(40));
        assert_eq!(lines[2], "Totale nuovi positivi");
        assert_eq!(lines[3], "700");
        assert!(text.contains("Dev std nuovi positivi\n12.3\n"));
        assert!(text.contains("Var pct nuovi positivi\nn/a\n"));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(3.0), "3");
        assert_eq!(format_value(-2.0), "-2");
        assert_eq!(format_value(2.26), "2.3");
    }
}

//! CLI entry point for the COVID digest service.
//!
//! `run` starts the supervised delivery service; the other subcommands
//! manage subscriptions in the state file and preview digests.

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use covid_digest::{
    config::Settings,
    digest::compose,
    fetch::{BasicClient, HttpClient},
    intent::{self, Outcome},
    observations::{ObservationStore, Source},
    output::{self, print_json, print_pretty},
    period::{Granularity, Period},
    service::Service,
    sources::{catalogue, covered_areas, fetch_dataset},
    state::StateStore,
    subscriptions::{QuietHours, RecipientId, Stream, SubscriptionConfig, SubscriptionRegistry},
    supervisor::{Exit, Supervisor},
    transport::{LogSink, TelegramSink, TransportSink},
};
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "covid_digest")]
#[command(about = "Periodic COVID-19 digests for subscribed recipients", long_about = None)]
struct Cli {
    /// Verbose stderr logging; `run` also stops at the first failure
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery service until interrupted
    Run {
        /// Log digests instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Create or replace a subscription
    Subscribe {
        recipient: String,

        /// day, week or month
        #[arg(short, long, default_value = "week")]
        frequency: Granularity,

        /// Stream as source:area, e.g. contagions:Lazio (repeatable)
        #[arg(short, long = "stream", required = true)]
        streams: Vec<Stream>,

        /// Quiet hours as HH:MM-HH:MM
        #[arg(short, long)]
        quiet_hours: Option<QuietHours>,
    },
    /// Change a subscription with a free-text request
    Configure {
        recipient: String,

        /// Request text, e.g. "vaccini Lazio ogni settimana"
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Remove a subscription
    Unsubscribe { recipient: String },
    /// Show a subscription and its last delivery
    Status { recipient: String },
    /// Fetch current data and print the digest a recipient would receive
    Preview {
        recipient: String,

        /// Report the period due on this date instead of today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok(); // Load .env file

    let cli = Cli::parse();
    let stderr_level = if cli.debug { "debug" } else { "info" };

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/covid_digest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("covid_digest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(stderr_level.parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;

    // Corrupt state is never guessed around: refuse to start.
    let state = match StateStore::load(&settings.state_path) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, path = %settings.state_path.display(), "Cannot load state");
            return Ok(ExitCode::FAILURE);
        }
    };
    let registry = SubscriptionRegistry::new(state.clone());
    let today = Local::now().date_naive();

    match cli.command {
        Commands::Run { dry_run } => {
            return run(settings, state, dry_run, cli.debug).await;
        }
        Commands::Subscribe {
            recipient,
            frequency,
            streams,
            quiet_hours,
        } => {
            let mut config = SubscriptionConfig::new(RecipientId::new(recipient), frequency, today)
                .with_quiet_hours(quiet_hours.unwrap_or(settings.quiet_hours));
            config.streams.extend(streams);
            registry.put(config.clone())?;
            info!(recipient = %config.recipient, streams = %config.signature(), frequency = %config.frequency, "Subscription saved");
        }
        Commands::Configure { recipient, text } => {
            let recipient = RecipientId::new(recipient);
            let text = text.join(" ");
            let known_areas = known_areas(&settings).await;
            let intents = intent::classify(&text, &known_areas);
            let current = registry.get(&recipient);

            match intent::apply(&intents, current.as_ref(), &recipient, today, settings.quiet_hours)? {
                Outcome::Updated(config) => {
                    registry.put(config.clone())?;
                    info!(recipient = %recipient, streams = %config.signature(), frequency = %config.frequency, quiet_hours = %config.quiet_hours, "Subscription updated");
                }
                Outcome::Disable => {
                    let removed = registry.remove(&recipient)?;
                    info!(recipient = %recipient, removed, "Subscription removed");
                }
                Outcome::Status => print_status(&state, &recipient),
                Outcome::Unrecognized => {
                    warn!(text = %text, "Request not understood");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Unsubscribe { recipient } => {
            let recipient = RecipientId::new(recipient);
            if registry.remove(&recipient)? {
                info!(recipient = %recipient, "Subscription removed");
            } else {
                warn!(recipient = %recipient, "No subscription to remove");
            }
        }
        Commands::Status { recipient } => {
            print_status(&state, &RecipientId::new(recipient));
        }
        Commands::Preview { recipient, date } => {
            let recipient = RecipientId::new(recipient);
            let config = registry
                .get(&recipient)
                .ok_or_else(|| anyhow!("{recipient} has no subscription"))?;

            let store = load_observations(&settings).await?;
            let period = Period::latest_due(date.unwrap_or(today), config.frequency);
            let digest = compose(&store, &recipient, &period, &config.streams);

            print_pretty(&digest);
            print_json(&digest)?;
            println!("{}", output::render(&digest));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Starts the supervised service and waits for it to stop.
async fn run(
    settings: Settings,
    state: Arc<StateStore>,
    dry_run: bool,
    fail_fast: bool,
) -> Result<ExitCode> {
    let sink: Arc<dyn TransportSink> = if dry_run {
        info!("Dry run: digests are logged, not sent");
        Arc::new(LogSink)
    } else {
        let token = settings
            .telegram_token
            .clone()
            .context("TELEGRAM_TOKEN must be set unless --dry-run is given")?;
        let client = BasicClient::with_timeout(settings.scheduler.send_timeout)?;
        Arc::new(TelegramSink::new(client, token))
    };
    let client: Arc<dyn HttpClient> = Arc::new(BasicClient::with_timeout(settings.fetch_timeout)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for shutdown signal");
                // keep the sender alive so the service is not stopped
                std::future::pending::<()>().await;
            }
        }
    });

    info!(
        subscriptions = state.subscriptions().len(),
        fail_fast,
        "Starting covid digest"
    );

    let supervisor = Supervisor::new(fail_fast).with_restart_delay(settings.restart_delay);
    let exit = supervisor
        .run(
            |_, shutdown| {
                Service::new(&settings, state.clone(), sink.clone(), client.clone()).run(shutdown)
            },
            shutdown_rx,
        )
        .await;

    if let Exit::Fatal(e) = &exit {
        error!(error = ?e, "Service stopped after a fatal error");
    }
    Ok(exit.code())
}

/// Downloads every dataset once into a fresh store. Datasets that fail are
/// skipped with a warning, and their source keeps an undeclared area list.
async fn load_observations(settings: &Settings) -> Result<ObservationStore> {
    let client = BasicClient::with_timeout(settings.fetch_timeout)?;
    let store = ObservationStore::new();
    let datasets = catalogue();
    let mut loaded = HashMap::new();

    for dataset in &datasets {
        match fetch_dataset(&client, dataset, settings.fetch_timeout).await {
            Ok(observations) => {
                let areas: BTreeSet<String> = observations.iter().map(|o| o.area.clone()).collect();
                loaded.insert(dataset.name, areas);
                store.record_all(observations);
            }
            Err(e) => warn!(dataset = dataset.name, error = %e, "Dataset unavailable"),
        }
    }
    for source in Source::ALL {
        if let Some(areas) = covered_areas(&datasets, source, &loaded) {
            store.declare_areas(source, areas);
        }
    }
    Ok(store)
}

/// Area names the sources track, for matching free-text requests.
async fn known_areas(settings: &Settings) -> Vec<String> {
    match load_observations(settings).await {
        Ok(store) => {
            let mut areas = Vec::new();
            for source in Source::ALL {
                for area in store.areas(source) {
                    if !areas.contains(&area) {
                        areas.push(area);
                    }
                }
            }
            areas
        }
        Err(e) => {
            warn!(error = %e, "Cannot list areas, only national streams are recognised");
            Vec::new()
        }
    }
}

fn print_status(state: &StateStore, recipient: &RecipientId) {
    let Some(config) = state.subscription(recipient) else {
        println!("{recipient}: no subscription");
        return;
    };

    println!("recipient:    {}", config.recipient);
    println!("frequency:    {}", config.frequency);
    println!("streams:      {}", config.signature());
    println!("quiet hours:  {}", config.quiet_hours);
    println!("since:        {}", config.subscribed_on);
    match state.last_sent(recipient) {
        Some(record) => println!(
            "last digest:  {} (sent {})",
            record.period,
            record.closed_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("last digest:  none"),
    }
}

//! Grid Hedger - Main Entry Point
//!
//! Runs the instrument stream fleet and reconciliation schedules, with
//! one-shot subcommands for reconciliation, hedging, and status inspection.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use grid_hedger::config::{Config, CredentialBook, FeedKind, StreamConfig};
use grid_hedger::exchange::{ConnectivityProbe, Venue, VenueClient};
use grid_hedger::execution::{DupeCache, ExecutionGateway};
use grid_hedger::hedge::{HedgeLegHandle, HedgeLoop};
use grid_hedger::reconcile::{run_schedule, ReconSummary, ReconcileEngine};
use grid_hedger::store::{DocumentStore, Filter, SqliteStore};
use grid_hedger::stream::{InstrumentStream, StreamEvent};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Grid Hedger CLI
#[derive(Parser)]
#[command(name = "grid-hedger")]
#[command(version, about = "Grid-triggered trading with delta-neutral hedge execution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass for a subaccount/symbol and exit
    Reconcile {
        /// Subaccount to reconcile
        #[arg(short, long)]
        subaccount: String,

        /// Instrument symbol
        #[arg(short = 'y', long)]
        symbol: String,

        /// Commencement date (YYYY-MM-DD) seeding the first run
        #[arg(long)]
        since: Option<String>,
    },

    /// Run a single delta-hedge invocation across spot and futures
    Hedge {
        /// Subaccount carrying both legs
        #[arg(short, long)]
        subaccount: String,

        /// Spot symbol to buy
        #[arg(short, long)]
        buy: String,

        /// Futures symbol to sell
        #[arg(short = 'l', long)]
        sell: String,

        /// Target quantity for the primary leg
        #[arg(short, long)]
        quantity: Decimal,
    },

    /// Show reconciliation summaries from the document store
    Status {
        /// Show stored fill counts per subaccount
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Reconcile {
            subaccount,
            symbol,
            since,
        }) => run_reconcile(&config, &subaccount, &symbol, since.as_deref()).await,
        Some(Commands::Hedge {
            subaccount,
            buy,
            sell,
            quantity,
        }) => run_hedge(&config, &subaccount, &buy, &sell, quantity).await,
        Some(Commands::Status { verbose }) => show_status(&config, verbose).await,
        None => run_trading(config).await,
    }
}

/// Default mode: open every configured instrument stream and keep the
/// reconciliation schedules running until shutdown.
async fn run_trading(config: Config) -> Result<()> {
    info!("grid-hedger v{} starting", env!("CARGO_PKG_VERSION"));
    log_config(&config);

    let credentials = config.credential_book();
    let store: Arc<dyn DocumentStore> =
        Arc::new(SqliteStore::new(&config.store_path).context("Failed to open document store")?);
    let probe = ConnectivityProbe::default();

    // Shutdown signal shared by every task.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut streams: Vec<Arc<InstrumentStream>> = Vec::new();
    let mut consumers = Vec::new();

    for stream_config in &config.streams {
        let client = build_client(&config, &credentials, stream_config.venue, &stream_config.subaccount)?;
        if let Err(e) = client.sync_clock().await {
            warn!(
                venue = %stream_config.venue,
                error = %e,
                "Clock sync failed; signed requests will use local time"
            );
        }

        let cache = Arc::new(DupeCache::new(stream_config.cache_limit));
        let gateway = Arc::new(ExecutionGateway::new(
            Arc::clone(&client),
            cache,
            &config.execution,
        ));

        let stream = Arc::new(InstrumentStream::new(
            stream_config.clone(),
            gateway,
            probe.clone(),
        ));
        let events = stream.open().await?;
        consumers.push(tokio::spawn(consume_events(
            stream_config.symbols.join("/"),
            events,
        )));
        streams.push(stream);

        // One reconciliation schedule per stream's (venue, subaccount,
        // instrument), advancing independently of the live feed.
        let commencement = Utc::now() - ChronoDuration::days(config.reconciliation.start_days_back);
        let engine = Arc::new(ReconcileEngine::new(
            client,
            Arc::clone(&store),
            config.reconciliation.clone(),
            stream_config.subaccount.clone(),
            stream_config.symbols[0].clone(),
            commencement,
        ));
        tokio::spawn(run_schedule(
            engine,
            Duration::from_secs(config.reconciliation.interval_secs),
            shutdown_rx.clone(),
        ));
    }

    if streams.is_empty() {
        warn!("No streams configured; nothing to do");
        return Ok(());
    }

    info!(streams = streams.len(), "All instrument streams open");

    // Park until shutdown, then close every stream handle.
    let mut shutdown = shutdown_rx.clone();
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    for stream in &streams {
        stream.close();
    }
    for consumer in consumers {
        consumer.abort();
    }

    info!("grid-hedger stopped");
    Ok(())
}

/// Log stream events. Trigger events are where a strategy callback would
/// hang off; the default binary just reports them.
async fn consume_events(label: String, mut events: tokio::sync::mpsc::Receiver<StreamEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Trigger(trigger) => {
                info!(
                    instrument = %label,
                    index = trigger.index,
                    level = %trigger.level,
                    side = trigger.side.as_str(),
                    price = %trigger.observed_price,
                    "Trigger"
                );
            }
            StreamEvent::Price { price } => {
                debug!(instrument = %label, %price, "Price");
            }
            StreamEvent::Depth { leg, snapshot } => {
                debug!(
                    instrument = %label,
                    leg,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Depth"
                );
            }
            StreamEvent::LegConnected { leg } => {
                info!(instrument = %label, leg, "Leg connected");
            }
            StreamEvent::LegDisconnected { leg } => {
                warn!(instrument = %label, leg, "Leg disconnected");
            }
        }
    }
}

async fn run_reconcile(
    config: &Config,
    subaccount: &str,
    symbol: &str,
    since: Option<&str>,
) -> Result<()> {
    let credentials = config.credential_book();
    let client = build_client(config, &credentials, Venue::BinanceFutures, subaccount)?;
    client.sync_clock().await.ok();

    let commencement = match since {
        Some(date) => {
            let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("Invalid date: {}", date))?;
            Utc.from_utc_datetime(&parsed.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        }
        None => Utc::now() - ChronoDuration::days(config.reconciliation.start_days_back),
    };

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::new(&config.store_path)?);
    let engine = ReconcileEngine::new(
        client,
        store,
        config.reconciliation.clone(),
        subaccount,
        symbol,
        commencement,
    );

    let report = engine.run_once(Utc::now()).await?;
    info!(
        first_run = report.first_run,
        net_new = report.net_new,
        duplicates_removed = report.duplicates_removed,
        error_flag = report.summary.recent_error_in_reconciliation,
        "Reconciliation complete"
    );
    Ok(())
}

async fn run_hedge(
    config: &Config,
    subaccount: &str,
    buy_symbol: &str,
    sell_symbol: &str,
    quantity: Decimal,
) -> Result<()> {
    let credentials = config.credential_book();
    let probe = ConnectivityProbe::default();

    let mut legs = Vec::with_capacity(2);
    for (venue, symbol) in [
        (Venue::BinanceSpot, buy_symbol),
        (Venue::BinanceFutures, sell_symbol),
    ] {
        let client = build_client(config, &credentials, venue, subaccount)?;
        client.sync_clock().await.ok();

        let cache = Arc::new(DupeCache::new(100));
        let gateway = Arc::new(ExecutionGateway::new(client, cache, &config.execution));

        let stream = Arc::new(InstrumentStream::new(
            StreamConfig {
                venue,
                subaccount: subaccount.to_string(),
                symbols: vec![symbol.to_string()],
                feed: FeedKind::Depth,
                grid: Vec::new(),
                announce_prices: false,
                control_time_secs: 30,
                cache_limit: 100,
            },
            Arc::clone(&gateway),
            probe.clone(),
        ));
        let events = stream.open().await?;

        legs.push(HedgeLegHandle {
            stream,
            events,
            gateway,
            symbol: symbol.to_string(),
        });
    }

    let sell_leg = legs.pop().expect("two legs were built");
    let buy_leg = legs.pop().expect("two legs were built");

    let tag = format!("hedge:{}-{}", buy_symbol, sell_symbol);
    let hedge = HedgeLoop::new(config.hedge.clone(), quantity, tag, buy_leg, sell_leg);

    match hedge.run().await {
        Some(outcome) => {
            info!(
                buy_price = %outcome.buy_price,
                sell_price = %outcome.sell_price,
                "Hedge fired"
            );
            if let Err(e) = &outcome.buy_result {
                error!(error = %e, "Buy leg failed");
            }
            if let Err(e) = &outcome.sell_result {
                error!(error = %e, "Sell leg failed");
            }
            Ok(())
        }
        None => Err(anyhow!("Depth streams ended before the hedge validated")),
    }
}

async fn show_status(config: &Config, verbose: bool) -> Result<()> {
    let store = SqliteStore::new(&config.store_path)?;
    let summaries = store.find_all("recon_summaries", &Filter::new()).await?;

    if summaries.is_empty() {
        println!("No reconciliation summaries recorded yet.");
        return Ok(());
    }

    for doc in summaries {
        let summary: ReconSummary = serde_json::from_value(doc)?;
        println!(
            "{}: start {} | last trade {} | trusted: {}",
            summary.subaccount,
            summary.start_date.format("%Y-%m-%d"),
            summary.last_trade_added.format("%Y-%m-%d %H:%M:%S"),
            if summary.recent_error_in_reconciliation {
                "NO (recompute required)"
            } else {
                "yes"
            }
        );

        if verbose {
            let fills = store
                .find_all(
                    "fills",
                    &Filter::new().eq("subaccount", summary.subaccount.as_str()),
                )
                .await?;
            println!("   {} stored fills", fills.len());
        }
    }

    Ok(())
}

fn build_client(
    config: &Config,
    credentials: &CredentialBook,
    venue: Venue,
    subaccount: &str,
) -> Result<Arc<VenueClient>> {
    let creds = credentials.require(venue, subaccount)?;
    let client = VenueClient::new(
        venue,
        creds,
        Duration::from_secs(config.execution.request_timeout_secs),
        config.execution.recv_window_ms,
    )
    .map_err(|e| anyhow!("Failed to build venue client: {}", e))?;
    Ok(Arc::new(client))
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // File appender for detailed logs
    let file_appender = tracing_appender::rolling::hourly("logs", "grid-hedger.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("grid_hedger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Streams: {}", config.streams.len());
    for stream in &config.streams {
        info!(
            "   - {} {} ({:?}, {} grid levels, control {}s)",
            stream.venue,
            stream.symbols.join("/"),
            stream.feed,
            stream.grid.len(),
            stream.control_time_secs
        );
    }
    info!("   Max order retries: {}", config.execution.max_retries);
    info!("   Recv window: {}ms", config.execution.recv_window_ms);
    info!(
        "   Reconciliation every {}s, {}-day pages",
        config.reconciliation.interval_secs, config.reconciliation.page_window_days
    );
    info!(
        "   Hedge: threshold {}, profit {}%, factor {}",
        config.hedge.validation_threshold, config.hedge.profit_percent, config.hedge.hedge_factor
    );
}

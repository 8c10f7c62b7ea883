use anyhow::Context;
use clap::{Parser, Subcommand};
use leverbot::api::{BinanceMarginGateway, BinanceSpotCandles, BybitGateway, CandleSource, ExchangeGateway};
use leverbot::config::{CandleSourceKind, Credentials, ExchangeKind, PersistenceBackend, Settings};
use leverbot::engine::ControlLoop;
use leverbot::execution::{FeedVenue, PriceFeed};
use leverbot::models::Side;
use leverbot::notify::{log_events, Notifier};
use leverbot::persistence::{JsonFileStore, RedisTrackerStore, TrackerStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "leverbot")]
#[command(about = "Leveraged trading bot with a ratcheting trailing stop", long_about = None)]
struct Cli {
    /// Config file path (defaults to ./leverbot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop (default)
    Run,
    /// Show open positions with PnL%, fees and trigger
    Status,
    /// Open a long market position
    Buy {
        /// Order size (contracts, or quote amount on margin exchanges)
        #[arg(long)]
        size: Option<f64>,
    },
    /// Open a short market position
    Sell {
        #[arg(long)]
        size: Option<f64>,
    },
    /// Close the position for a symbol
    Close {
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(settings, cli.config).await,
        Commands::Status => status(settings).await,
        Commands::Buy { size } => manual_open(settings, Side::Long, size).await,
        Commands::Sell { size } => manual_open(settings, Side::Short, size).await,
        Commands::Close { symbol } => manual_close(settings, &symbol).await,
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leverbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_gateway(settings: &Settings) -> anyhow::Result<Arc<dyn ExchangeGateway>> {
    let exchange = &settings.exchange;
    let credentials = Credentials::from_env(exchange.kind)?;
    let gateway: Arc<dyn ExchangeGateway> = match exchange.kind {
        ExchangeKind::Bybit => Arc::new(BybitGateway::new(
            credentials,
            exchange.testnet,
            exchange.rate_limit_per_sec,
        )?),
        ExchangeKind::BinanceMargin => Arc::new(BinanceMarginGateway::new(
            credentials,
            exchange.testnet,
            exchange.rate_limit_per_sec,
        )?),
    };
    tracing::info!("Exchange gateway: {}", gateway.name());
    Ok(gateway)
}

fn build_candle_source(
    settings: &Settings,
    gateway: &Arc<dyn ExchangeGateway>,
) -> anyhow::Result<Arc<dyn CandleSource>> {
    Ok(match settings.exchange.candle_source {
        CandleSourceKind::Exchange => Arc::new(Arc::clone(gateway)),
        CandleSourceKind::BinanceSpot => {
            Arc::new(BinanceSpotCandles::new(settings.exchange.rate_limit_per_sec)?)
        }
    })
}

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn TrackerStore>> {
    let persistence = &settings.persistence;
    Ok(match persistence.backend {
        PersistenceBackend::File => Arc::new(JsonFileStore::new(&persistence.path)),
        PersistenceBackend::Redis => {
            let redis_url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
            Arc::new(RedisTrackerStore::connect(&redis_url, persistence.redis_key.clone()).await?)
        }
    })
}

/// Build a control loop without a live price stream (one-shot commands)
async fn build_engine(
    settings: Settings,
    price: watch::Receiver<Option<f64>>,
    notifier: Notifier,
) -> anyhow::Result<(ControlLoop, watch::Sender<Arc<Settings>>)> {
    let gateway = build_gateway(&settings)?;
    let candles = build_candle_source(&settings, &gateway)?;
    let store = build_store(&settings).await?;
    let (settings_tx, settings_rx) = watch::channel(Arc::new(settings));
    let engine = ControlLoop::new(gateway, candles, store, settings_rx, price, notifier);
    let restored = engine.restore().await?;
    tracing::info!("Restored {} position trackers", restored);
    Ok((engine, settings_tx))
}

async fn run(settings: Settings, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    tracing::info!("🚀 leverbot starting");
    tracing::info!(
        "  {} on {:?} x{} | auto_open={} auto_close={} | default SL {}%",
        settings.trading.symbol,
        settings.exchange.kind,
        settings.trading.leverage,
        settings.trading.auto_open,
        settings.trading.auto_close,
        settings.trading.default_stop_loss
    );

    let (notifier, events) = Notifier::channel();
    let event_task = tokio::spawn(log_events(events));

    let (feed, price_rx) = PriceFeed::new(
        FeedVenue::from(settings.exchange.kind),
        &settings.trading.symbol,
        settings.exchange.testnet,
        &settings.alerts,
        notifier.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed_task = tokio::spawn(feed.run(shutdown_rx.clone()));

    let (engine, settings_tx) = build_engine(settings, price_rx, notifier).await?;
    let engine = Arc::new(engine);
    let engine_task = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));
    let reload_task = tokio::spawn(reload_on_hangup(config_path, settings_tx));

    tracing::info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");

    shutdown_tx.send(true)?;
    reload_task.abort();
    engine_task.await?;
    feed_task.await?;
    drop(engine);
    event_task.abort();

    tracing::info!("👋 leverbot stopped");
    Ok(())
}

/// Publish a fresh settings snapshot on every SIGHUP
#[cfg(unix)]
async fn reload_on_hangup(path: Option<PathBuf>, tx: watch::Sender<Arc<Settings>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return;
        }
    };
    while hangups.recv().await.is_some() {
        match Settings::load(path.as_deref()) {
            Ok(settings) => {
                tx.send_replace(Arc::new(settings));
                tracing::info!("Configuration reloaded");
            }
            Err(e) => tracing::warn!("Configuration reload rejected: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_path: Option<PathBuf>, tx: watch::Sender<Arc<Settings>>) {
    tx.closed().await;
}

async fn status(settings: Settings) -> anyhow::Result<()> {
    let fee = settings.trading.fee_rate_per_side;
    let margin_calls = settings.trading.margin_calls;
    let (_price_tx, price_rx) = watch::channel(None);
    let (engine, _settings_tx) = build_engine(settings, price_rx, Notifier::disabled()).await?;

    engine.poll_positions().await?;
    let balance = engine.balance_tick().await?;
    println!("Balance: {:.2}", balance);

    let book = engine.state().book.lock().await;
    if book.is_empty() {
        println!("No open positions");
    }
    for tracker in book.iter() {
        let p = &tracker.position;
        let pnl = p
            .pnl_percent(fee)
            .map(|v| format!("{:.2}%", v))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "{:<12} {:<5} qty {:<10} entry {:<12.4} mark {:<12.4} x{:<4} PnL {:>8} (adj {:.2}, fees {:.2}) trigger {:.2}% max {:.2}% margin calls {}/{}",
            p.symbol,
            p.side,
            p.quantity,
            p.entry_price,
            p.mark_price,
            p.leverage,
            pnl,
            p.adjusted_unrealized_pnl(fee),
            p.fees_paid(fee),
            tracker.trigger_stop_loss_percent,
            tracker.max_pnl_percent,
            tracker.used_margin_calls,
            margin_calls
        );
    }
    Ok(())
}

async fn manual_open(settings: Settings, side: Side, size: Option<f64>) -> anyhow::Result<()> {
    let (_price_tx, price_rx) = watch::channel(None);
    let (engine, _settings_tx) = build_engine(settings, price_rx, Notifier::disabled()).await?;
    engine.poll_positions().await?;

    let outcome = engine.manual_open(side, size).await?;
    match (outcome.opened, outcome.details) {
        (true, Some(details)) => {
            println!(
                "Opened {} {} x{} @ {}",
                details.side,
                details.symbol,
                details.leverage,
                details
                    .entry_price
                    .map(|p| format!("{:.4}", p))
                    .unwrap_or_else(|| "market".to_string())
            );
            Ok(())
        }
        _ => anyhow::bail!(
            "open failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn manual_close(settings: Settings, symbol: &str) -> anyhow::Result<()> {
    let (_price_tx, price_rx) = watch::channel(None);
    let (engine, _settings_tx) = build_engine(settings, price_rx, Notifier::disabled()).await?;

    let outcome = engine.manual_close(symbol).await?;
    if !outcome.closed {
        anyhow::bail!(
            "close failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!("Closed {}", outcome.symbol);
    Ok(())
}

//! Grid trading engine - main entry point
//!
//! This binary provides six subcommands:
//! - run: start the bot scheduler and tick all active bots
//! - ingest: run the price ingest worker (ticker stream -> cache)
//! - screen: screen all eligible pairs for grid profitability
//! - backtest: run one backtest over fetched candles
//! - optimize: grid-search parameters for one symbol
//! - download: fetch archive candles and write CSV

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gridbot::backtest::run_backtest;
use gridbot::cache::PriceCache;
use gridbot::exchange::{
    BinanceMarketClient, BinanceOrderExecutor, OrderExecutor, SimulatedExecutor,
};
use gridbot::ingest::PriceIngestWorker;
use gridbot::klines::KlinesFetcher;
use gridbot::optimize::optimize_parameters;
use gridbot::scheduler::BotScheduler;
use gridbot::screening::ScreeningJob;
use gridbot::store::Store;
use gridbot::{GridParams, Settings, Symbol};

#[derive(Parser, Debug)]
#[command(name = "gridbot")]
#[command(about = "Grid trading engine with live bots, backtesting, optimization, and screening", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot scheduler (restarts every active bot)
    Run,

    /// Run the price ingest worker (ticker stream -> cache fanout)
    Ingest,

    /// Screen all eligible pairs for grid trading profitability
    Screen {
        /// Owner of the screening results
        #[arg(long, default_value = "1")]
        user_id: i64,

        /// Candle interval
        #[arg(short, long, default_value = "1h")]
        interval: String,

        /// Candles to fetch per symbol
        #[arg(short, long, default_value = "2000")]
        limit: usize,

        /// Simulation budget in quote currency
        #[arg(long, default_value = "1000.0")]
        amount: f64,
    },

    /// Backtest one parameter set over fetched candles
    Backtest {
        /// Trading pair, e.g. BTCUSDC
        #[arg(short, long)]
        symbol: String,

        #[arg(short, long, default_value = "1h")]
        interval: String,

        #[arg(short, long, default_value = "2000")]
        limit: usize,

        /// Lower bound of the grid band
        #[arg(long)]
        min: f64,

        /// Upper bound of the grid band
        #[arg(long)]
        max: f64,

        #[arg(long, default_value = "10")]
        levels: u32,

        /// Profit target per position, percent
        #[arg(long, default_value = "2.0")]
        sell_pct: f64,

        #[arg(long, default_value = "1000.0")]
        amount: f64,
    },

    /// Optimize grid parameters for one symbol
    Optimize {
        #[arg(short, long)]
        symbol: String,

        #[arg(short, long, default_value = "1h")]
        interval: String,

        #[arg(short, long, default_value = "2000")]
        limit: usize,

        #[arg(long, default_value = "1000.0")]
        amount: f64,

        /// Fraction of the series used for training
        #[arg(long, default_value = "0.7")]
        train_ratio: f64,

        /// Number of top results to show
        #[arg(short, long, default_value = "10")]
        top: usize,
    },

    /// Download archive candles for a symbol and write CSV
    Download {
        #[arg(short, long)]
        symbol: String,

        #[arg(short, long, default_value = "1m")]
        interval: String,

        /// Number of past days to fetch
        #[arg(short, long, default_value = "7")]
        days: u32,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        output: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,tungstenite=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("logging initialized");
        info!("log file: {}", log_path.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let (command_name, file_only) = match &cli.command {
        Commands::Run => ("run", false),
        Commands::Ingest => ("ingest", false),
        Commands::Screen { .. } => ("screen", false),
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", false),
        Commands::Download { .. } => ("download", true), // progress bar owns the console
    };
    setup_logging(cli.verbose, command_name, file_only)?;

    let settings = Settings::from_env();

    match cli.command {
        Commands::Run => cmd_run(settings).await,
        Commands::Ingest => cmd_ingest(settings).await,
        Commands::Screen {
            user_id,
            interval,
            limit,
            amount,
        } => cmd_screen(settings, user_id, interval, limit, amount).await,
        Commands::Backtest {
            symbol,
            interval,
            limit,
            min,
            max,
            levels,
            sell_pct,
            amount,
        } => cmd_backtest(settings, symbol, interval, limit, min, max, levels, sell_pct, amount).await,
        Commands::Optimize {
            symbol,
            interval,
            limit,
            amount,
            train_ratio,
            top,
        } => cmd_optimize(settings, symbol, interval, limit, amount, train_ratio, top).await,
        Commands::Download {
            symbol,
            interval,
            days,
            output,
        } => cmd_download(settings, symbol, interval, days, output).await,
    }
}

/// Select the order executor for the configured trading mode
fn build_executor(settings: &Settings) -> Result<Arc<dyn OrderExecutor>> {
    if settings.binance_live_trading {
        let api_key = settings
            .binance_api_key
            .clone()
            .context("BINANCE_API_KEY is required for live trading")?;
        let api_secret = settings
            .binance_secret_key
            .clone()
            .context("BINANCE_SECRET_KEY is required for live trading")?;
        warn!("live trading is ENABLED - real orders will be placed");
        Ok(Arc::new(BinanceOrderExecutor::new(
            &settings.binance_base_url,
            api_key,
            api_secret,
        )))
    } else {
        info!("simulated trading mode (set BINANCE_LIVE_TRADING=true for real orders)");
        Ok(Arc::new(SimulatedExecutor))
    }
}

async fn cmd_run(settings: Settings) -> Result<()> {
    let store = Arc::new(Store::open(&settings.database_path)?);
    let cache = PriceCache::connect(&settings.redis_url).await?;
    let executor = build_executor(&settings)?;

    let scheduler = BotScheduler::new(store, cache, executor, settings.tunables);
    let started = scheduler.start_all_active()?;
    info!("scheduler running with {started} bot(s); press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping scheduler");
    Ok(())
}

async fn cmd_ingest(settings: Settings) -> Result<()> {
    let store = Arc::new(Store::open(&settings.database_path)?);
    let cache = PriceCache::connect(&settings.redis_url).await?;
    let worker = PriceIngestWorker::new(cache, store, settings.binance_ws_url.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await
}

async fn cmd_screen(
    settings: Settings,
    user_id: i64,
    interval: String,
    limit: usize,
    amount: f64,
) -> Result<()> {
    let store = Arc::new(Store::open(&settings.database_path)?);
    let cache = PriceCache::connect(&settings.redis_url).await?;
    let market = BinanceMarketClient::new(&settings.binance_base_url);
    let fetcher = KlinesFetcher::new(&settings.binance_base_url);

    let task_id = format!("screening-{}", Utc::now().timestamp_millis());
    info!("launching screening task {task_id}");

    let job = ScreeningJob::new(cache, store.clone(), market, fetcher, settings.tunables);
    job.run(&task_id, user_id, &interval, limit, amount).await?;

    let results = store.list_screening_results(&task_id)?;
    println!("\nTop screening results ({task_id}):");
    println!(
        "{:<12} {:>10} {:>10} {:>7} {:>7} {:>8} {:>10}",
        "symbol", "train%", "test%", "levels", "sell%", "trades", "win rate"
    );
    for row in results.iter().take(20) {
        println!(
            "{:<12} {:>10.3} {:>10.3} {:>7} {:>7.1} {:>8} {:>10.2}",
            row.symbol,
            row.best_pnl_pct,
            row.test_pnl_pct,
            row.best_grid_levels,
            row.best_sell_percentage,
            row.num_trades,
            row.win_rate
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_backtest(
    settings: Settings,
    symbol: String,
    interval: String,
    limit: usize,
    min: f64,
    max: f64,
    levels: u32,
    sell_pct: f64,
    amount: f64,
) -> Result<()> {
    let params = GridParams {
        min_price: min,
        max_price: max,
        total_amount: amount,
        grid_levels: levels,
        sell_percentage: sell_pct,
    };
    params.validate()?;

    let symbol = Symbol::new(&symbol);
    let fetcher = KlinesFetcher::new(&settings.binance_base_url);
    let klines = fetcher
        .fetch_klines(symbol.as_str(), &interval, limit)
        .await?;
    anyhow::ensure!(
        klines.len() >= 100,
        "insufficient historical data ({} candles)",
        klines.len()
    );
    let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();

    let result = run_backtest(symbol.as_str(), &closes, &params, &settings.tunables);

    println!("\nBacktest {} ({} candles @ {})", symbol, closes.len(), interval);
    println!("  pnl:            {:+.4} ({:+.3}%)", result.total_pnl, result.total_pnl_pct);
    println!("  trades:         {} ({} buys / {} sells)", result.num_trades, result.num_buys, result.num_sells);
    println!("  win rate:       {:.2}", result.win_rate);
    println!("  max drawdown:   {:.4}", result.max_drawdown);
    println!("  sharpe:         {:.4}", result.sharpe_ratio);
    println!("  open positions: {} (unrealized {:+.4})", result.final_open_positions, result.unrealized_pnl);
    Ok(())
}

async fn cmd_optimize(
    settings: Settings,
    symbol: String,
    interval: String,
    limit: usize,
    amount: f64,
    train_ratio: f64,
    top: usize,
) -> Result<()> {
    let symbol = Symbol::new(&symbol);
    let fetcher = KlinesFetcher::new(&settings.binance_base_url);
    let klines = fetcher
        .fetch_klines(symbol.as_str(), &interval, limit)
        .await?;
    anyhow::ensure!(
        klines.len() >= 100,
        "insufficient historical data ({} candles)",
        klines.len()
    );
    let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();

    let tunables = settings.tunables;
    let sym = symbol.as_str().to_string();
    let result = tokio::task::spawn_blocking(move || {
        optimize_parameters(&sym, &closes, amount, train_ratio, None, None, top, &tunables)
    })
    .await??;

    println!(
        "\nOptimization {} (train {} / test {} candles)",
        symbol, result.train_size, result.test_size
    );
    println!(
        "{:>4} {:>12} {:>12} {:>7} {:>7} {:>10} {:>8}",
        "#", "min", "max", "levels", "sell%", "train%", "trades"
    );
    for (i, r) in result.all_results.iter().enumerate() {
        println!(
            "{:>4} {:>12.6} {:>12.6} {:>7} {:>7.1} {:>10.3} {:>8}",
            i + 1,
            r.min_price,
            r.max_price,
            r.grid_levels,
            r.sell_percentage,
            r.total_pnl_pct,
            r.num_trades
        );
    }
    println!(
        "\nBest on test split: {:+.3}% (win rate {:.2}, {} trades)",
        result.test_result.total_pnl_pct,
        result.test_result.win_rate,
        result.test_result.num_trades
    );
    Ok(())
}

async fn cmd_download(
    settings: Settings,
    symbol: String,
    interval: String,
    days: u32,
    output: String,
) -> Result<()> {
    let symbol = Symbol::new(&symbol);
    let fetcher = KlinesFetcher::new(&settings.binance_base_url);

    let bar = ProgressBar::new(days as u64 + 1);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .expect("valid progress template"),
    );
    let on_progress = |_day: usize, _total: usize, date: &str| {
        bar.set_message(date.to_string());
        bar.inc(1);
    };

    let klines = fetcher
        .fetch_klines_archive(symbol.as_str(), &interval, days, Some(&on_progress))
        .await?;
    bar.finish_with_message("done");

    anyhow::ensure!(!klines.is_empty(), "no archive data for {symbol}");

    std::fs::create_dir_all(&output)?;
    let path = PathBuf::from(&output).join(format!("{}_{}.csv", symbol, interval));
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["time", "open", "high", "low", "close", "volume"])?;
    for k in &klines {
        writer.write_record([
            k.open_time.to_string(),
            k.open.to_string(),
            k.high.to_string(),
            k.low.to_string(),
            k.close.to_string(),
            k.volume.to_string(),
        ])?;
    }
    writer.flush()?;

    println!("wrote {} candles to {}", klines.len(), path.display());
    Ok(())
}

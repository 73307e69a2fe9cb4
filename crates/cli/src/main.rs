mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use sigtrade_api::AppState;
use sigtrade_brokers_common::simulated::SimulatedTerminal;
use sigtrade_brokers_metatrader::MetaTraderTerminal;
use sigtrade_core::{ChartSignal, TradingTerminal};
use sigtrade_data::{LatestSignalFile, LotTracker, SignalStore};
use sigtrade_engine::{BreakevenMonitor, CycleOutcome, Orchestrator};
use sigtrade_vision::{ChartCapturer, SignalDetector};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "sigtrade")]
#[command(about = "Chart-signal auto-trader for MetaTrader 5: capture, detect, trade, manage")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Configuration file (defaults to ./sigtrade.toml when present)
    #[arg(short, long, env = "SIGTRADE_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "MT5_LOGIN")]
    mt5_login: Option<u64>,

    #[arg(long, env = "MT5_PASSWORD", hide_env_values = true)]
    mt5_password: Option<String>,

    #[arg(long, env = "MT5_SERVER")]
    mt5_server: Option<String>,

    #[arg(long, env = "VISION_API_KEY", hide_env_values = true)]
    vision_api_key: Option<String>,

    /// Trade against an in-process simulated terminal
    #[arg(long, global = true)]
    paper: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a chart screenshot
    Capture,

    /// Detect the chart signal on a screenshot and record it
    Detect {
        /// Screenshot to analyse (defaults to the configured image path)
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Source label stored with the history row
        #[arg(long, default_value = "vision")]
        source: String,
    },

    /// Copy the latest-signal file into the signal history
    Ingest {
        /// Latest-signal file (defaults to the configured path)
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(long, default_value = "file")]
        source: String,
    },

    /// Run one trading cycle on the latest stored signal
    Trade {
        /// Skip breakeven monitoring after the cycle
        #[arg(long)]
        no_monitor: bool,
    },

    /// Capture, detect, record, and trade in one pass
    Run {
        #[arg(long)]
        no_monitor: bool,

        /// Use the existing screenshot instead of taking a new one
        #[arg(long)]
        skip_capture: bool,
    },

    /// Show recent signal history
    Signals {
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    /// Inspect or reset the lot escalation tracker
    Lot {
        #[command(subcommand)]
        command: LotCommands,
    },

    /// Start the local control API
    Serve {
        /// Bind address (overrides the configured one)
        #[arg(short, long)]
        bind: Option<String>,

        /// Send orders instead of echoing them
        #[arg(long)]
        live: bool,
    },
}

#[derive(Subcommand)]
enum LotCommands {
    /// Print the stored lot
    Show,
    /// Restore the configured base lot
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    match cli.command {
        Commands::Capture => {
            let path = ChartCapturer::new(config.capture.clone()).capture().await?;
            println!("{}", path.display());
        }
        Commands::Detect { image, source } => {
            let signal = detect(&config, image, &source).await?;
            println!("{signal}");
        }
        Commands::Ingest { file, source } => {
            let store = SignalStore::connect(&config.database_url).await?;
            let file = LatestSignalFile::new(file.unwrap_or_else(|| config.latest_signal_path.clone()));
            let record = store.ingest_latest_file(&file, &source).await?;
            println!(
                "Stored signal #{} ({})",
                record.id.unwrap_or_default(),
                record.chart_signal
            );
        }
        Commands::Trade { no_monitor } => {
            trade(&config, cli.paper, no_monitor).await?;
        }
        Commands::Run {
            no_monitor,
            skip_capture,
        } => {
            if !skip_capture {
                ChartCapturer::new(config.capture.clone()).capture().await?;
            }
            let signal = detect(&config, None, "vision").await?;
            tracing::info!(signal = %signal, "Signal recorded");
            trade(&config, cli.paper, no_monitor).await?;
        }
        Commands::Signals { limit } => {
            let store = SignalStore::connect(&config.database_url).await?;
            let rows = store.recent(limit).await?;
            if rows.is_empty() {
                println!("No signals stored");
            }
            for row in rows {
                println!(
                    "{:>6}  {}  {:<14}  {}",
                    row.id.unwrap_or_default(),
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.chart_signal,
                    row.source
                );
            }
        }
        Commands::Lot { command } => {
            let tracker = LotTracker::new(config.lot_tracker(cli.paper));
            let record = match command {
                LotCommands::Show => tracker.load()?,
                LotCommands::Reset => tracker.reset()?,
            };
            println!(
                "Lot: {} (awaiting close: {}) [{}]",
                record.base_lot_size,
                record.awaiting_close,
                tracker.path().display()
            );
        }
        Commands::Serve { bind, live } => {
            let mut api = config.api.clone();
            if let Some(bind) = bind {
                api.bind = bind;
            }
            if live {
                api.dry_run = false;
            }
            let store = SignalStore::connect(&config.database_url).await?;
            let mut terminal = open_terminal(&config, cli.paper);
            terminal.connect().await.context("Terminal connection failed")?;
            sigtrade_api::start_server(AppState::new(terminal, store, api)).await?;
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if let Some(login) = cli.mt5_login {
        config.terminal.login = Some(login);
    }
    if let Some(password) = &cli.mt5_password {
        config.terminal.password = Some(password.clone());
    }
    if let Some(server) = &cli.mt5_server {
        config.terminal.server = Some(server.clone());
    }
    if let Some(key) = &cli.vision_api_key {
        config.vision.api_key = Some(key.clone());
    }
}

fn open_terminal(config: &AppConfig, paper: bool) -> Box<dyn TradingTerminal> {
    if paper {
        let paper = &config.paper;
        let mut terminal = SimulatedTerminal::new(paper.terminal_config());
        terminal.set_tick(&paper.symbol, paper.bid, paper.ask);
        tracing::info!(symbol = %paper.symbol, "Using simulated terminal");
        Box::new(terminal)
    } else {
        Box::new(MetaTraderTerminal::new(config.terminal.clone()))
    }
}

/// Detect on `image`, write the latest-signal file, and append it to history.
async fn detect(config: &AppConfig, image: Option<PathBuf>, source: &str) -> Result<ChartSignal> {
    let detector = SignalDetector::new(config.vision.clone())?;
    let signal = match image {
        Some(path) => match detector.detect_file(&path).await {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, image = %path.display(), "Chart signal detection failed");
                e.sentinel()
            }
        },
        None => detector.detect().await,
    };

    let file = LatestSignalFile::new(&config.latest_signal_path);
    file.write_chart_signal(signal)?;
    let store = SignalStore::connect(&config.database_url).await?;
    store.ingest_latest_file(&file, source).await?;
    Ok(signal)
}

/// One trading cycle, then breakeven monitoring of the affected set.
async fn trade(config: &AppConfig, paper: bool, no_monitor: bool) -> Result<()> {
    let store = SignalStore::connect(&config.database_url).await?;
    let orchestrator = Orchestrator::new(
        config.trading.clone(),
        LotTracker::new(config.lot_tracker(paper)),
    );

    let mut terminal = open_terminal(config, paper);
    terminal.connect().await.context("Terminal connection failed")?;

    let outcome = orchestrator.run_cycle(terminal.as_mut(), &store).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            disconnect(terminal.as_mut()).await;
            return Err(e.into());
        }
    };

    match &outcome {
        CycleOutcome::NoSignal { signal } => {
            println!("No actionable signal ({})", signal.map_or("none", |s| s.as_str()));
        }
        CycleOutcome::AlreadyActive { symbol, side } => {
            println!("{side} set already active on {symbol}");
        }
        CycleOutcome::Opened(set) => {
            println!(
                "Opened {}/{} {} legs on {} at {} lots",
                set.opened.len(),
                set.opened.len() + set.failed,
                set.side,
                set.symbol,
                set.lot
            );
        }
    }

    if let (false, Some((symbol, side))) = (no_monitor, outcome.monitor_target()) {
        let monitor = BreakevenMonitor::new(
            config.breakeven.clone(),
            config.trading.magic,
            config.trading.comment_prefix.clone(),
        );
        let summary = monitor.run(terminal.as_mut(), symbol, side).await;
        println!(
            "Breakeven monitor: {} polls, {} stops moved, {} errors",
            summary.polls, summary.modifications, summary.errors
        );
    }

    disconnect(terminal.as_mut()).await;
    Ok(())
}

async fn disconnect(terminal: &mut dyn TradingTerminal) {
    if let Err(e) = terminal.disconnect().await {
        tracing::warn!(error = %e, "Terminal disconnect failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigtrade_core::SignalRecord;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sigtrade-cli-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_paper_trade_keeps_live_lot_tracker() {
        let dir = scratch_dir("paper");
        let mut config = AppConfig::default();
        config.database_url = format!("sqlite://{}", dir.join("signals.db").display());
        config.lots.path = dir.join("live_lots.json");
        config.paper.lots_path = dir.join("paper_lots.json");

        let store = SignalStore::connect(&config.database_url).await.unwrap();
        store
            .append(&SignalRecord::chart(ChartSignal::Buy, "test"))
            .await
            .unwrap();

        // Every paper run starts from an empty simulated book
        trade(&config, true, true).await.unwrap();
        trade(&config, true, true).await.unwrap();

        assert!(!config.lots.path.exists());
        let paper = LotTracker::new(config.lot_tracker(true)).load().unwrap();
        assert_eq!(paper.base_lot_size, config.lots.base_lot + config.lots.increment);
        assert!(paper.awaiting_close);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

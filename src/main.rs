//! ==============================================================================
//! main.rs - h2o-monitor entry point
//! ==============================================================================
//!
//! purpose:
//!     one binary, two roles:
//!
//!     h2o-monitor serve      run the ingest/query server the probe pushes to
//!     h2o-monitor monitor    poll a server, keep the live series, record sessions
//!
//! responsibilities:
//!     - load monitor.toml (or defaults) and apply cli overrides
//!     - initialize tracing
//!     - wire server context / poller + console to the runtime
//!     - shut down cleanly on ctrl-c (and `quit` for the monitor)
//!
//! relationships:
//!     - uses: server.rs, poller.rs, console.rs, config.rs
//!
//! ==============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use h2o_monitor::config::MonitorConfig;
use h2o_monitor::console::{self, Command as ConsoleCommand, Reply};
use h2o_monitor::poller::{MonitorState, Poller, TickOutcome};
use h2o_monitor::recorder::StopOutcome;
use h2o_monitor::server::{self, ServerContext};

#[derive(Parser, Debug)]
#[command(name = "h2o-monitor")]
#[command(about = "Water quality (TDS + temperature) ingest server and live monitor")]
#[command(version)]
struct Cli {
    /// Config file path (default: config/monitor.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept readings from the probe and serve the latest one
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Durable CSV log
        #[arg(long)]
        log_path: Option<PathBuf>,
    },
    /// Poll a server, show live readings, record sessions (commands on stdin)
    Monitor {
        /// Base url of the server, e.g. http://192.168.0.105:5000
        #[arg(long)]
        server_url: Option<String>,
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Directory for record_<n>.csv files
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: configuration (before logging, which takes its level from it)
    let (mut config, source) = MonitorConfig::load_or_default(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli.command);
    config.validate()?;

    // step 2: logging
    init_tracing(&config.logging.level);
    match &source {
        Some(path) => info!("loaded config from {}", path.display()),
        None => info!("no config file found - using defaults"),
    }
    config.log_summary();

    // step 3: run the selected role
    match cli.command {
        Mode::Serve { .. } => run_server(config).await,
        Mode::Monitor { .. } => run_monitor(config).await,
    }
}

fn apply_overrides(config: &mut MonitorConfig, mode: &Mode) {
    match mode {
        Mode::Serve { host, port, log_path } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(path) = log_path {
                config.server.log_path = path.clone();
            }
        }
        Mode::Monitor { server_url, interval_ms, output_dir } => {
            if let Some(url) = server_url {
                config.poller.server_url = url.clone();
            }
            if let Some(ms) = interval_ms {
                config.poller.interval_ms = *ms;
            }
            if let Some(dir) = output_dir {
                config.recorder.output_dir = dir.clone();
            }
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ==============================================================================
// serve
// ==============================================================================

async fn run_server(config: MonitorConfig) -> Result<()> {
    let ctx = ServerContext::open(&config.server)
        .context("cannot open the reading log; refusing to start without it")?
        .with_sensor_output(config.logging.show_sensor_data);

    let addr = config.server.bind_addr()?;
    info!("probe should post to http://<this-host>:{}/api/data", addr.port());

    server::serve(Arc::new(ctx), addr, shutdown_signal()).await
}

// ==============================================================================
// monitor
// ==============================================================================

async fn run_monitor(config: MonitorConfig) -> Result<()> {
    let state = MonitorState::new(&config.poller, &config.recorder)?.shared();
    let poller = Poller::new(&config.poller, state.clone())?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let show = config.logging.show_sensor_data;
    let poll_task = tokio::spawn(poller.run(move |state, outcome| redraw(state, outcome, show), shutdown_rx));

    info!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => {
                        let reply = console::apply(&mut *state.lock().await, command);
                        match reply {
                            Reply::Info(msg) => info!("{}", msg),
                            Reply::Warn(msg) => warn!("{}", msg),
                            Reply::Quit => break,
                        }
                    }
                    Err(msg) => warn!("{}", msg),
                },
                Ok(None) => {
                    debug!("stdin closed; ctrl-c to exit");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("stdin read failed: {}; ctrl-c to exit", e);
                    stdin_open = false;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    let _ = shutdown_tx.send(());
    poll_task.await.context("poller task failed")?;

    // don't lose a session that was still running
    let mut state = state.lock().await;
    if state.recorder.is_recording() || state.recorder.buffered() > 0 {
        match state.recorder.stop() {
            Ok(StopOutcome::Saved { path, rows }) => {
                info!("Saved: {} ({} readings)", path.display(), rows)
            }
            Ok(StopOutcome::NothingRecorded) => {}
            Err(e) => warn!("recording lost on exit: {}", e),
        }
    }
    Ok(())
}

/// the display hook: called after every tick with a complete frame
fn redraw(state: &MonitorState, outcome: &TickOutcome, show: bool) {
    if !show {
        return;
    }
    if let TickOutcome::Updated(r) = outcome {
        let rec = if state.recorder.is_recording() { " [REC]" } else { "" };
        info!(
            "{} | TDS: {:.1} ppm | Temp: {:.1}°C | {}/{} points{}",
            r.timestamp,
            r.tds_value,
            r.temperature,
            state.series.len(),
            state.series.capacity(),
            rec
        );
    }
}

//! ==============================================================================
//! console.rs - user commands for the monitor
//! ==============================================================================
//!
//! purpose:
//!     the monitor's controls, one command per stdin line:
//!
//!         start           begin a recording
//!         stop            end it and save record_<n>.csv
//!         url <base-url>  poll a different server from the next tick on
//!         status          show url, recorder state, last reading
//!         quit            exit (an active recording is saved first)
//!
//! relationships:
//!     - used by: main.rs (monitor subcommand stdin loop)
//!     - uses: poller.rs (MonitorState), recorder.rs (StopOutcome)
//!
//! ==============================================================================

use std::str::FromStr;

use crate::poller::MonitorState;
use crate::recorder::StopOutcome;

pub const HELP: &str = "commands: start | stop | url <base-url> | status | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Url(String),
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_lowercase();
        let arg = parts.next();

        match (verb.as_str(), arg) {
            ("start", None) => Ok(Command::Start),
            ("stop", None) => Ok(Command::Stop),
            ("url", Some(url)) => Ok(Command::Url(url.to_string())),
            ("url", None) => Err("usage: url <base-url>".to_string()),
            ("status", None) => Ok(Command::Status),
            ("help" | "?", _) => Ok(Command::Help),
            ("quit" | "exit", None) => Ok(Command::Quit),
            _ => Err(format!("unknown command `{}`; {}", line.trim(), HELP)),
        }
    }
}

/// what the caller should tell the user (and whether to keep going)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Info(String),
    Warn(String),
    Quit,
}

/// run one command against the shared state; caller holds the lock
pub fn apply(state: &mut MonitorState, command: Command) -> Reply {
    match command {
        Command::Start => match state.recorder.start() {
            Ok(()) => Reply::Info("Recording: ON".to_string()),
            Err(e) => Reply::Warn(format!("cannot start: {}", e)),
        },
        Command::Stop => stop_reply(state),
        Command::Url(url) => match state.set_server_url(&url) {
            Ok(()) => Reply::Info(format!("polling {}", state.latest_url())),
            Err(e) => Reply::Warn(format!("{:#}", e)),
        },
        Command::Status => {
            let last = state
                .series
                .latest()
                .map(|r| format!("{} tds={:.1} temp={:.1}", r.timestamp, r.tds_value, r.temperature))
                .unwrap_or_else(|| "none".to_string());
            Reply::Info(format!(
                "server={} recorder={:?} buffered={} points={}/{} last={}",
                state.server_url(),
                state.recorder.state(),
                state.recorder.buffered(),
                state.series.len(),
                state.series.capacity(),
                last
            ))
        }
        Command::Help => Reply::Info(HELP.to_string()),
        Command::Quit => Reply::Quit,
    }
}

fn stop_reply(state: &mut MonitorState) -> Reply {
    match state.recorder.stop() {
        Ok(StopOutcome::Saved { path, rows }) => {
            Reply::Info(format!("Saved: {} ({} readings)", path.display(), rows))
        }
        Ok(StopOutcome::NothingRecorded) => Reply::Warn("No data recorded!".to_string()),
        Err(e) => Reply::Warn(format!("{}; run `stop` again to retry", e)),
    }
}

//! ==============================================================================
//! poller.rs - monitor side: fetch loop and rolling series
//! ==============================================================================
//!
//! purpose:
//!     every `interval_ms` ask the server for its latest reading, push it into
//!     fixed-size rolling series for display, and mirror it into the recorder
//!     when a recording is running.
//!
//! architecture:
//!
//!     ┌───────────── poll loop (one task) ──────────────┐
//!     │ tick: read url ─> GET /api/latest ─> mutate ─> redraw
//!     └──────────────────────────│────────────────────────┘
//!                                │ Arc<Mutex<MonitorState>>
//!     ┌──────────────────────────┴────────────────────────┐
//!     │ MonitorState { server_url, series, recorder }     │
//!     └──────────────────────────┬────────────────────────┘
//!                                │
//!                     console commands (console.rs)
//!
//!     the lock is NOT held during the fetch; every mutation (push, observe,
//!     start/stop, url change) is one critical section, so redraw never sees a
//!     half-updated frame and user actions serialize with ticks.
//!
//! failure handling:
//!     a failed or timed-out fetch never ends the loop. with `keep_last` the
//!     series is left as-is; with `sentinel` an empty series gets one
//!     "No Data" entry, replaced by the first real reading.
//!
//! relationships:
//!     - used by: main.rs (monitor subcommand), tests/end_to_end.rs
//!     - uses: recorder.rs (Recorder), config.rs (PollerConfig, FailurePolicy)
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{FailurePolicy, PollerConfig, RecorderConfig};
use crate::domain::{Reading, NO_DATA_TIMESTAMP};
use crate::error::FetchError;
use crate::recorder::Recorder;

/// path of the query endpoint on the server
pub const LATEST_PATH: &str = "/api/latest";

// ==============================================================================
// rolling series
// ==============================================================================

/// three parallel fifo buffers (timestamps, tds, temperature) capped at
/// `capacity`; the oldest entry is evicted first
#[derive(Debug, Clone)]
pub struct RollingSeries {
    capacity: usize,
    timestamps: VecDeque<String>,
    tds: VecDeque<f64>,
    temperature: VecDeque<f64>,
}

impl RollingSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            timestamps: VecDeque::with_capacity(capacity),
            tds: VecDeque::with_capacity(capacity),
            temperature: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, reading: &Reading) {
        if self.capacity == 0 {
            return;
        }
        // a real reading replaces the placeholder rather than sitting next to it
        if !reading.is_no_data() && self.is_placeholder() {
            self.clear();
        }
        if self.timestamps.len() == self.capacity {
            self.timestamps.pop_front();
            self.tds.pop_front();
            self.temperature.pop_front();
        }
        self.timestamps.push_back(reading.timestamp.clone());
        self.tds.push_back(reading.tds_value);
        self.temperature.push_back(reading.temperature);
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.tds.clear();
        self.temperature.clear();
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timestamps(&self) -> &VecDeque<String> {
        &self.timestamps
    }

    pub fn tds_values(&self) -> &VecDeque<f64> {
        &self.tds
    }

    pub fn temperatures(&self) -> &VecDeque<f64> {
        &self.temperature
    }

    /// oldest to newest
    pub fn readings(&self) -> impl Iterator<Item = Reading> + '_ {
        self.timestamps
            .iter()
            .zip(&self.tds)
            .zip(&self.temperature)
            .map(|((ts, tds), temp)| Reading {
                timestamp: ts.clone(),
                tds_value: *tds,
                temperature: *temp,
            })
    }

    pub fn latest(&self) -> Option<Reading> {
        let i = self.len().checked_sub(1)?;
        Some(Reading {
            timestamp: self.timestamps[i].clone(),
            tds_value: self.tds[i],
            temperature: self.temperature[i],
        })
    }

    fn is_placeholder(&self) -> bool {
        self.len() == 1 && self.timestamps[0] == NO_DATA_TIMESTAMP
    }
}

// ==============================================================================
// monitor state
// ==============================================================================

/// everything the poll loop and the user share
#[derive(Debug)]
pub struct MonitorState {
    server_url: String,
    pub series: RollingSeries,
    pub recorder: Recorder,
}

pub type SharedMonitor = Arc<Mutex<MonitorState>>;

impl MonitorState {
    pub fn new(poller: &PollerConfig, recorder: &RecorderConfig) -> anyhow::Result<Self> {
        let mut state = Self {
            server_url: String::new(),
            series: RollingSeries::new(poller.capacity),
            recorder: Recorder::new(&recorder.output_dir),
        };
        state.set_server_url(&poller.server_url)?;
        Ok(state)
    }

    pub fn shared(self) -> SharedMonitor {
        Arc::new(Mutex::new(self))
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// takes effect on the next tick
    pub fn set_server_url(&mut self, url: &str) -> anyhow::Result<()> {
        let url = url.trim();
        let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid server url `{}`", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("server url must be http or https, got `{}`", url));
        }
        self.server_url = url.trim_end_matches('/').to_string();
        Ok(())
    }

    /// full url of the query endpoint
    pub fn latest_url(&self) -> String {
        latest_url(&self.server_url)
    }
}

/// `http://host:5000` -> `http://host:5000/api/latest`; a url that already
/// names the endpoint is kept
pub fn latest_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(LATEST_PATH) {
        base.to_string()
    } else {
        format!("{}{}", base, LATEST_PATH)
    }
}

// ==============================================================================
// poller
// ==============================================================================

#[derive(Debug)]
pub enum TickOutcome {
    Updated(Reading),
    /// fetch failed, series untouched
    Stale(FetchError),
    /// fetch failed on an empty series, placeholder added
    NoData(FetchError),
}

pub struct Poller {
    client: reqwest::Client,
    interval: Duration,
    policy: FailurePolicy,
    state: SharedMonitor,
}

impl Poller {
    pub fn new(config: &PollerConfig, state: SharedMonitor) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            interval: config.interval(),
            policy: config.on_failure,
            state,
        })
    }

    pub fn state(&self) -> &SharedMonitor {
        &self.state
    }

    /// GET the latest reading, bounded by the client timeout
    pub async fn fetch(&self, url: &str) -> Result<Reading, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_request(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
        }

        response.json::<Reading>().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::Decode { url: url.to_string(), source: e }
            }
        })
    }

    /// one poll cycle
    pub async fn tick(&self) -> TickOutcome {
        let url = self.state.lock().await.latest_url();
        let fetched = self.fetch(&url).await;

        let mut state = self.state.lock().await;
        match fetched {
            Ok(reading) => {
                state.series.push(&reading);
                state.recorder.observe(&reading);
                TickOutcome::Updated(reading)
            }
            Err(e) => {
                warn!("error fetching data: {}", e);
                if self.policy == FailurePolicy::Sentinel && state.series.is_empty() {
                    state.series.push(&Reading::no_data());
                    TickOutcome::NoData(e)
                } else {
                    TickOutcome::Stale(e)
                }
            }
        }
    }

    /// tick on a fixed cadence until `shutdown` fires
    ///
    /// `redraw` runs after each tick with the state locked, so it always sees
    /// a complete frame
    pub async fn run<F>(self, mut redraw: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: FnMut(&MonitorState, &TickOutcome) + Send,
    {
        let mut ticker = interval(self.interval);
        // a slow fetch delays the schedule instead of causing a burst of ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "poller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    let state = self.state.lock().await;
                    redraw(&*state, &outcome);
                }
                _ = shutdown.recv() => {
                    debug!("poller shutdown signal received");
                    break;
                }
            }
        }
        info!("poller stopped");
    }
}

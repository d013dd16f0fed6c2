//! ==============================================================================
//! server.rs - ingestion + query endpoints
//! ==============================================================================
//!
//! purpose:
//!     the probe pushes readings here; the monitor polls the latest one.
//!
//!     ┌────────────┐  POST /api/data   ┌──────────────────────────────┐
//!     │ esp32 probe│ ────────────────> │ ServerContext                │
//!     └────────────┘                   │  writer: Mutex<WriteState>   │──> database.csv
//!                                      │  cache:  RwLock<Reading>     │
//!     ┌────────────┐  GET /api/latest  │                              │
//!     │  monitor   │ <──────────────── │                              │
//!     └────────────┘                   └──────────────────────────────┘
//!
//! write path (one ingest at a time, under the writer mutex):
//!     1. stamp = max(now, last stamp), second resolution
//!     2. append the row to the log        -- failure: 500, cache untouched
//!     3. publish the reading to the cache -- readers see old or new, never half
//!
//!     publishing while still holding the writer mutex keeps cache order equal
//!     to log order when ingests race.
//!
//! relationships:
//!     - used by: main.rs (serve subcommand), tests/end_to_end.rs
//!     - uses: store.rs (LogSink), domain.rs (Reading, Measurement)
//!
//! ==============================================================================

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Local, NaiveDateTime, SubsecRound};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::domain::{Measurement, MissingFieldPolicy, Reading, TIMESTAMP_FORMAT};
use crate::error::{IngestError, StorageError};
use crate::store::{CsvLog, LogSink};

// ==============================================================================
// shared state
// ==============================================================================

struct WriteState {
    log: Box<dyn LogSink>,
    last_stamp: Option<NaiveDateTime>,
}

/// everything a request handler needs; shared as Arc<ServerContext>
pub struct ServerContext {
    cache: RwLock<Reading>,
    writer: Mutex<WriteState>,
    policy: MissingFieldPolicy,
    show_sensor_data: bool,
}

impl ServerContext {
    pub fn new(log: impl LogSink + 'static, policy: MissingFieldPolicy) -> Self {
        Self {
            cache: RwLock::new(Reading::sentinel()),
            writer: Mutex::new(WriteState { log: Box::new(log), last_stamp: None }),
            policy,
            show_sensor_data: false,
        }
    }

    /// open (or create) the csv log named in the config
    ///
    /// failing here must abort startup: running without the log would
    /// silently drop the durability guarantee
    pub fn open(config: &ServerConfig) -> Result<Self, StorageError> {
        let log = CsvLog::open(&config.log_path)?;
        Ok(Self::new(log, config.missing_fields))
    }

    /// resume stamping after `last`, as if it had been the previous ingest
    #[cfg(test)]
    pub(crate) fn with_last_stamp(mut self, last: NaiveDateTime) -> Self {
        self.writer.get_mut().last_stamp = Some(last);
        self
    }

    /// log every accepted reading at info instead of debug
    pub fn with_sensor_output(mut self, show: bool) -> Self {
        self.show_sensor_data = show;
        self
    }

    /// decode a raw body and ingest it
    pub async fn ingest_body(&self, body: &[u8]) -> Result<Reading, IngestError> {
        let measurement = Measurement::from_body(body, self.policy)?;
        self.ingest(measurement).await
    }

    /// stamp, persist, then publish one reading
    pub async fn ingest(&self, measurement: Measurement) -> Result<Reading, IngestError> {
        let mut writer = self.writer.lock().await;

        let now = Local::now().naive_local().trunc_subsecs(0);
        let stamp = match writer.last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let reading = Reading::stamped(stamp, measurement.tds_value, measurement.temperature);

        writer.log.append(&reading)?;
        writer.last_stamp = Some(stamp);

        *self.cache.write().await = reading.clone();
        Ok(reading)
    }

    /// snapshot of the cache; the sentinel until the first ingest
    pub async fn latest(&self) -> Reading {
        self.cache.read().await.clone()
    }
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/data", post(ingest_handler))
        .route("/api/latest", get(latest_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// bind and serve until `shutdown` resolves
pub async fn serve(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve_on(listener, ctx, shutdown).await
}

/// serve on an already-bound listener (tests bind port 0)
pub async fn serve_on(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("accepting readings at http://{}/api/data", addr);
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")?;
    info!("web server stopped");
    Ok(())
}

/// POST /api/data
///
/// the body is taken raw so that malformed json gets the same error shape as
/// every other rejection
async fn ingest_handler(
    State(ctx): State<Arc<ServerContext>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, IngestError> {
    match ctx.ingest_body(&body).await {
        Ok(reading) => {
            if ctx.show_sensor_data {
                info!(tds = reading.tds_value, temp = reading.temperature, "data received");
            } else {
                debug!(tds = reading.tds_value, temp = reading.temperature, "data received");
            }
            Ok(Json(json!({
                "status": "success",
                "message": "Data saved!",
                "timestamp": reading.timestamp,
            })))
        }
        Err(e) => {
            match &e {
                IngestError::Storage(_) => error!(kind = e.kind(), "ingest failed: {}", e),
                _ => warn!(kind = e.kind(), "ingest rejected: {}", e),
            }
            Err(e)
        }
    }
}

/// GET /api/latest
async fn latest_handler(State(ctx): State<Arc<ServerContext>>) -> Json<Reading> {
    Json(ctx.latest().await)
}

/// GET /health
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Local::now().to_rfc3339(),
    }))
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match self {
            IngestError::MalformedInput(_) | IngestError::InvalidFormat { .. } => {
                StatusCode::BAD_REQUEST
            }
            IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "status": "error", "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// parse a server stamp back into a datetime
pub fn parse_stamp(stamp: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

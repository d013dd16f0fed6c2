//! ==============================================================================
//! h2o-monitor - water quality ingest server and polling monitor
//! ==============================================================================
//!
//! two halves sharing one data model:
//!
//!     probe ──POST /api/data──> server ──> database.csv (append-only)
//!                                  │
//!                                  └─ latest reading cache
//!                                          ▲
//!     monitor ──GET /api/latest (every 2s)─┘
//!        ├─ rolling series (last 50) -> redraw
//!        └─ recorder -> record_<n>.csv
//!
//! ==============================================================================

pub mod config;
pub mod console;
pub mod domain;
pub mod error;
pub mod poller;
pub mod recorder;
pub mod server;
pub mod store;

pub use config::MonitorConfig;
pub use domain::{Measurement, Reading};
pub use poller::{MonitorState, Poller, RollingSeries};
pub use recorder::{Recorder, StopOutcome};
pub use server::ServerContext;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use h2o_monitor::config::{FailurePolicy, PollerConfig, RecorderConfig, ServerConfig};
use h2o_monitor::console::{self, Command, Reply};
use h2o_monitor::domain::MissingFieldPolicy;
use h2o_monitor::poller::{MonitorState, Poller, TickOutcome};
use h2o_monitor::recorder::StopOutcome;
use h2o_monitor::server::{self, ServerContext};
use h2o_monitor::store::{count_rows, read_all, CsvLog};

struct TestServer {
    url: String,
    log_path: PathBuf,
    _stop: oneshot::Sender<()>,
}

async fn spawn_server(dir: &Path, name: &str) -> TestServer {
    let log_path = dir.join(name);
    let log = CsvLog::open(&log_path).unwrap().without_sync();
    let ctx = Arc::new(ServerContext::new(log, MissingFieldPolicy::Strict));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve_on(listener, ctx, async {
        rx.await.ok();
    }));

    TestServer { url, log_path, _stop: tx }
}

async fn post(url: &str, body: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/data", url))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn get(url: &str) -> Value {
    reqwest::get(url).await.unwrap().json().await.unwrap()
}

fn monitor(url: &str, capacity: usize, output_dir: &Path) -> Poller {
    let config = PollerConfig {
        server_url: url.to_string(),
        interval_ms: 1000,
        timeout_ms: 500,
        capacity,
        on_failure: FailurePolicy::KeepLast,
    };
    let recorder = RecorderConfig { output_dir: output_dir.to_path_buf() };
    let state = MonitorState::new(&config, &recorder).unwrap().shared();
    Poller::new(&config, state).unwrap()
}

fn tds(i: u32) -> String {
    json!({ "tds_value": 100.0 + i as f64, "temperature": 20.0 }).to_string()
}

#[tokio::test]
async fn test_ingest_and_query_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let srv = spawn_server(dir.path(), "database.csv").await;

    // nothing yet
    let latest = get(&format!("{}/api/latest", srv.url)).await;
    assert_eq!(latest, json!({"timestamp": "N/A", "tds_value": 0.0, "temperature": 0.0}));

    let (status, body) = post(&srv.url, r#"{"tds_value": 150.2, "temperature": 24.5}"#).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");

    let latest = get(&format!("{}/api/latest", srv.url)).await;
    assert_eq!(latest["tds_value"], 150.2);
    assert_eq!(latest["temperature"], 24.5);
    assert_ne!(latest["timestamp"], "N/A");
    assert_eq!(latest["timestamp"], body["timestamp"]);
    assert_eq!(count_rows(&srv.log_path).unwrap(), 1);

    // rejections: 400, nothing changes
    let (status, body) = post(&srv.url, r#"{"tds_value": "abc"}"#).await;
    assert_eq!(status, 400);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("Invalid data format"));

    let (status, _) = post(&srv.url, "definitely not json").await;
    assert_eq!(status, 400);

    assert_eq!(get(&format!("{}/api/latest", srv.url)).await, latest);
    assert_eq!(count_rows(&srv.log_path).unwrap(), 1);

    let health = get(&format!("{}/health", srv.url)).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["timestamp"].is_string());
}

#[tokio::test]
async fn test_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        log_path: dir.path().join("data").join("database.csv"),
        ..ServerConfig::default()
    };

    let ctx = ServerContext::open(&config).unwrap();
    ctx.ingest_body(tds(1).as_bytes()).await.unwrap();
    ctx.ingest_body(tds(2).as_bytes()).await.unwrap();
    drop(ctx);

    let ctx = ServerContext::open(&config).unwrap();
    assert!(ctx.latest().await.is_sentinel());
    ctx.ingest_body(tds(3).as_bytes()).await.unwrap();

    let rows = read_all(&config.log_path).unwrap();
    let values: Vec<f64> = rows.iter().map(|r| r.tds_value).collect();
    assert_eq!(values, vec![101.0, 102.0, 103.0]);
}

#[tokio::test]
async fn test_recording_captures_ticks_between_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let srv = spawn_server(dir.path(), "database.csv").await;
    let out = dir.path().join("sessions");
    std::fs::create_dir_all(&out).unwrap();
    let poller = monitor(&srv.url, 50, &out);

    // before start: shown, not recorded
    post(&srv.url, &tds(0)).await;
    assert!(matches!(poller.tick().await, TickOutcome::Updated(_)));

    assert!(matches!(
        console::apply(&mut *poller.state().lock().await, Command::Start),
        Reply::Info(_)
    ));
    for i in 1..=3 {
        post(&srv.url, &tds(i)).await;
        assert!(matches!(poller.tick().await, TickOutcome::Updated(_)));
    }
    let outcome = poller.state().lock().await.recorder.stop().unwrap();

    let path = out.join("record_1.csv");
    assert_eq!(outcome, StopOutcome::Saved { path: path.clone(), rows: 3 });
    let recorded: Vec<f64> = read_all(&path).unwrap().iter().map(|r| r.tds_value).collect();
    assert_eq!(recorded, vec![101.0, 102.0, 103.0]);

    // ticks after stop are not recorded
    post(&srv.url, &tds(4)).await;
    poller.tick().await;
    let outcome = poller.state().lock().await.recorder.stop().unwrap();
    assert_eq!(outcome, StopOutcome::NothingRecorded);

    assert_eq!(poller.state().lock().await.series.len(), 5);
}

#[tokio::test]
async fn test_series_keeps_last_n_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let srv = spawn_server(dir.path(), "database.csv").await;
    let poller = monitor(&srv.url, 4, dir.path());

    for i in 0..10 {
        post(&srv.url, &tds(i)).await;
        poller.tick().await;
        assert!(poller.state().lock().await.series.len() <= 4);
    }

    let state = poller.state().lock().await;
    let values: Vec<f64> = state.series.tds_values().iter().copied().collect();
    assert_eq!(values, vec![106.0, 107.0, 108.0, 109.0]);
    assert_eq!(state.series.timestamps().len(), 4);
    assert_eq!(state.series.temperatures().len(), 4);
}

#[tokio::test]
async fn test_server_url_change_applies_on_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let a = spawn_server(dir.path(), "a.csv").await;
    let b = spawn_server(dir.path(), "b.csv").await;
    post(&a.url, &tds(1)).await;
    post(&b.url, &tds(2)).await;

    let poller = monitor(&a.url, 50, dir.path());
    match poller.tick().await {
        TickOutcome::Updated(r) => assert_eq!(r.tds_value, 101.0),
        other => panic!("unexpected {:?}", other),
    }

    let reply = console::apply(&mut *poller.state().lock().await, Command::Url(b.url.clone()));
    assert!(matches!(reply, Reply::Info(_)));

    match poller.tick().await {
        TickOutcome::Updated(r) => assert_eq!(r.tds_value, 102.0),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_server_going_away_leaves_series_intact() {
    let dir = tempfile::tempdir().unwrap();
    let srv = spawn_server(dir.path(), "database.csv").await;
    let poller = monitor(&srv.url, 50, dir.path());

    post(&srv.url, &tds(1)).await;
    poller.tick().await;

    // point at a port nobody listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);
    poller.state().lock().await.set_server_url(&dead_url).unwrap();

    assert!(matches!(poller.tick().await, TickOutcome::Stale(_)));
    let state = poller.state().lock().await;
    assert_eq!(state.series.len(), 1);
    assert_eq!(state.series.latest().unwrap().tds_value, 101.0);
}

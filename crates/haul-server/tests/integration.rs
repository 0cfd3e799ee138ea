//! End-to-end tests over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use haul_server::config::ServerConfig;
use haul_server::server::HaulServer;
use haul_server::source::SimulatedSource;
use haul_settings::SourceSettings;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const TIMEOUT: Duration = Duration::from_secs(10);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    server: Arc<HaulServer>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn http(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

fn fast_source() -> SourceSettings {
    SourceSettings {
        layer_count: 3,
        layer_bytes: 8192,
        chunk_bytes: 4096,
        chunk_delay_ms: 0,
        checkpoint_bytes: 8192,
        lookup_delay_ms: 0,
        unavailable: vec!["ghost".into()],
    }
}

/// Slow enough that a job is still running after a round trip.
fn slow_source() -> SourceSettings {
    SourceSettings {
        chunk_delay_ms: 40,
        ..fast_source()
    }
}

async fn boot(source: SourceSettings) -> TestServer {
    boot_with(source, |_| {}).await
}

async fn boot_with(source: SourceSettings, tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        downloads_dir: dir.path().join("downloads"),
        ..ServerConfig::default()
    };
    tweak(&mut config);
    let server = Arc::new(HaulServer::new(
        config,
        Arc::new(SimulatedSource::new(source)),
        None,
    ));
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        addr,
        server,
        _dir: dir,
    }
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Collect events up to and including the first one of type `until`.
async fn collect_until(ws: &mut WsStream, until: &str) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = next_event(ws).await;
        let done = event["type"] == until;
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Returns `true` if no text frame arrives within `window`.
async fn stays_quiet(ws: &mut WsStream, window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(_))) => {}
            Ok(_) => return true,
        }
    }
}

#[tokio::test]
async fn alpine_end_to_end() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;

    let greeting = next_event(&mut ws).await;
    assert_eq!(greeting["type"], "session");
    assert_eq!(greeting["data"]["resumed"], false);
    let token = greeting["data"]["token"].as_str().unwrap().to_owned();
    assert_eq!(greeting["data"]["room"], token.as_str());

    send(&mut ws, json!({"type": "check_exists", "reference": "alpine:latest"})).await;
    let exists = next_event(&mut ws).await;
    assert_eq!(exists["type"], "exists_result");
    assert_eq!(exists["data"]["exists"], true);
    assert_eq!(exists["data"]["sequence"], 1);

    send(&mut ws, json!({"type": "start_job", "reference": "alpine:latest"})).await;
    let started = next_event(&mut ws).await;
    assert_eq!(started["type"], "job_started");
    assert_eq!(started["data"]["reference"], "library/alpine:latest");

    let events = collect_until(&mut ws, "pull_done").await;
    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds[0], "start_pull");
    let compress_at = kinds.iter().position(|k| *k == "start_compress").unwrap();
    assert!(compress_at > 1);
    assert!(kinds[1..compress_at].iter().all(|k| *k == "pull_progress"));
    assert!(
        kinds[compress_at + 1..kinds.len() - 1]
            .iter()
            .all(|k| *k == "compress_progress")
    );
    assert!(kinds.len() - compress_at > 2, "expected compress_progress lines");

    let closing = &events[compress_at - 1]["data"];
    assert_eq!(closing["index"], 3);
    assert_eq!(closing["total"], 3);

    let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(events.iter().all(|e| e["room"] == token.as_str()));

    let done = events.last().unwrap();
    assert_eq!(done["data"]["tar_path"], "alpine-latest.tar");

    let client = reqwest::Client::new();
    let url = ts.http(&format!("/api/download/alpine-latest.tar?room={token}"));
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-tar"
    );
    assert!(
        resp.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("alpine-latest.tar")
    );
    let body = resp.bytes().await.unwrap();
    assert!(body.len() > 3 * 8192);

    let again = client.get(&url).send().await.unwrap();
    assert_eq!(again.status(), 404);
    let error: Value = again.json().await.unwrap();
    assert_eq!(error["code"], "ARTIFACT_NOT_FOUND");
}

#[tokio::test]
async fn zero_heartbeat_interval_still_delivers_events() {
    let ts = boot_with(fast_source(), |config| config.heartbeat_interval_secs = 0).await;
    let mut ws = connect(&ts.ws_url()).await;
    assert_eq!(next_event(&mut ws).await["type"], "session");

    send(&mut ws, json!({"type": "check_exists", "reference": "alpine"})).await;
    assert_eq!(next_event(&mut ws).await["type"], "exists_result");
}

#[tokio::test]
async fn upgrade_sets_session_cookie() {
    let ts = boot(fast_source()).await;
    let (mut ws, response) = connect_async(ts.ws_url()).await.unwrap();
    let token = next_event(&mut ws).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_owned();

    let cookie = response.headers()["set-cookie"].to_str().unwrap();
    assert!(cookie.starts_with(&format!("haul_session={token}")));
}

#[tokio::test]
async fn reconnect_with_token_gets_snapshot() {
    let ts = boot(slow_source()).await;
    let mut first = connect(&ts.ws_url()).await;
    let token = next_event(&mut first).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_owned();

    send(&mut first, json!({"type": "start_job", "reference": "alpine"})).await;
    assert_eq!(next_event(&mut first).await["type"], "job_started");
    let _ = collect_until(&mut first, "pull_progress").await;
    drop(first);

    let mut second = connect(&format!("{}?token={token}", ts.ws_url())).await;
    let greeting = next_event(&mut second).await;
    assert_eq!(greeting["type"], "session");
    assert_eq!(greeting["data"]["resumed"], true);
    assert_eq!(greeting["data"]["token"], token.as_str());

    let snapshot = next_event(&mut second).await;
    assert_eq!(snapshot["type"], "job_snapshot");
    assert_eq!(snapshot["room"], token.as_str());
    assert_eq!(snapshot["data"]["reference"], "library/alpine:latest");
    let phase = snapshot["data"]["phase"].as_str().unwrap();
    assert!(["pulling", "compressing", "ready"].contains(&phase), "{phase}");

    // Live events continue after the snapshot, and the artifact is still ours.
    if phase != "ready" {
        let done = collect_until(&mut second, "pull_done").await;
        assert!(
            done.windows(2)
                .all(|w| w[0]["seq"].as_u64() < w[1]["seq"].as_u64())
        );
        assert!(done[0]["seq"].as_u64() > snapshot["seq"].as_u64());
    }
    let resp = reqwest::get(ts.http(&format!("/api/download/alpine-latest.tar?room={token}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn cookie_identifies_session_without_query() {
    let ts = boot(fast_source()).await;
    let mut first = connect(&ts.ws_url()).await;
    let token = next_event(&mut first).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_owned();

    let mut request = ts.ws_url().into_client_request().unwrap();
    let _ = request.headers_mut().insert(
        "cookie",
        format!("haul_session={token}").parse().unwrap(),
    );
    let (mut second, _) = connect_async(request).await.unwrap();
    let greeting = next_event(&mut second).await;
    assert_eq!(greeting["data"]["resumed"], true);
    assert_eq!(greeting["data"]["token"], token.as_str());

    // The older connection lost the room.
    let displaced = next_event(&mut first).await;
    assert_eq!(displaced["type"], "displaced");
    assert_eq!(displaced["data"]["room"], token.as_str());
}

#[tokio::test]
async fn leave_then_join_resumes_room() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let token = next_event(&mut ws).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_owned();

    send(&mut ws, json!({"type": "leave"})).await;
    let left = next_event(&mut ws).await;
    assert_eq!(left["type"], "left");
    assert_eq!(left["data"]["room"], token.as_str());

    send(&mut ws, json!({"type": "start_job", "reference": "alpine"})).await;
    let rejected = next_event(&mut ws).await;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["data"]["code"], "UNKNOWN_ROOM");

    send(&mut ws, json!({"type": "leave"})).await;
    assert_eq!(next_event(&mut ws).await["data"]["code"], "UNKNOWN_ROOM");

    send(&mut ws, json!({"type": "join", "token": token.as_str()})).await;
    let joined = next_event(&mut ws).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["data"]["resumed"], true);
    assert_eq!(joined["data"]["room"], token.as_str());
}

#[tokio::test]
async fn unknown_token_gets_fresh_session() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&format!("{}?token=made-up", ts.ws_url())).await;
    let greeting = next_event(&mut ws).await;
    assert_eq!(greeting["data"]["resumed"], false);
    assert_ne!(greeting["data"]["token"], "made-up");
}

#[tokio::test]
async fn second_start_is_rejected() {
    let ts = boot(slow_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    send(&mut ws, json!({"type": "start_job", "reference": "alpine"})).await;
    let started = next_event(&mut ws).await;
    assert_eq!(started["type"], "job_started");
    let first_job = started["data"]["job_id"].clone();

    send(&mut ws, json!({"type": "start_job", "reference": "ubuntu"})).await;
    let events = collect_until(&mut ws, "error").await;
    let error = events.last().unwrap();
    assert_eq!(error["data"]["code"], "JOB_ALREADY_RUNNING");
    assert!(
        error["data"]["message"]
            .as_str()
            .unwrap()
            .contains(first_job.as_str().unwrap())
    );

    let rest = collect_until(&mut ws, "pull_done").await;
    assert_eq!(rest.last().unwrap()["data"]["tar_path"], "alpine-latest.tar");
}

#[tokio::test]
async fn events_stay_in_their_room() {
    let ts = boot(fast_source()).await;
    let mut a = connect(&ts.ws_url()).await;
    let mut b = connect(&ts.ws_url()).await;
    let _ = next_event(&mut a).await;
    let _ = next_event(&mut b).await;

    send(&mut a, json!({"type": "start_job", "reference": "alpine"})).await;
    let _ = collect_until(&mut a, "pull_done").await;

    assert!(stays_quiet(&mut b, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn http_pull_drives_socket_room() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let token = next_event(&mut ws).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_owned();

    let resp = reqwest::get(ts.http(&format!("/api/pull/{token}/alpine:latest")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert!(body["job_id"].is_string());

    let events = collect_until(&mut ws, "pull_done").await;
    assert_eq!(events[0]["type"], "start_pull");
}

#[tokio::test]
async fn http_pull_into_unknown_room() {
    let ts = boot(fast_source()).await;
    let resp = reqwest::get(ts.http("/api/pull/not-a-room/alpine")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "UNKNOWN_ROOM");
}

#[tokio::test]
async fn missing_image_fails_job() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    send(&mut ws, json!({"type": "start_job", "reference": "ghost"})).await;
    let events = collect_until(&mut ws, "pull_failed").await;
    let failed = events.last().unwrap();
    assert_eq!(failed["data"]["phase"], "validating");
    assert_eq!(failed["data"]["code"], "REFERENCE_NOT_FOUND");
}

#[tokio::test]
async fn newest_check_wins() {
    let ts = boot(SourceSettings {
        lookup_delay_ms: 200,
        ..fast_source()
    })
    .await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    send(&mut ws, json!({"type": "check_exists", "reference": "ghost"})).await;
    send(&mut ws, json!({"type": "check_exists", "reference": "alpine"})).await;

    let result = next_event(&mut ws).await;
    assert_eq!(result["type"], "exists_result");
    assert_eq!(result["data"]["sequence"], 2);
    assert_eq!(result["data"]["reference"], "library/alpine:latest");
    assert_eq!(result["data"]["exists"], true);
    assert!(stays_quiet(&mut ws, Duration::from_millis(400)).await);
}

#[tokio::test]
async fn invalid_frames_get_errors() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    send(&mut ws, json!({"type": "reboot"})).await;
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "INVALID_MESSAGE");

    send(&mut ws, json!({"type": "check_exists", "reference": "Bad Name"})).await;
    let invalid = next_event(&mut ws).await;
    assert_eq!(invalid["type"], "exists_result");
    assert_eq!(invalid["data"]["error"]["code"], "INVALID_REFERENCE");
}

#[tokio::test]
async fn health_counts_connections() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    let health: Value = reqwest::get(ts.http("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["active_sessions"], 1);
}

#[tokio::test]
async fn graceful_shutdown_closes_sockets() {
    let ts = boot(fast_source()).await;
    let mut ws = connect(&ts.ws_url()).await;
    let _ = next_event(&mut ws).await;

    ts.server.shutdown().graceful_shutdown(Duration::from_secs(2)).await;

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

//! End-to-end tests over real HTTP connections against a running server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use framecast::config::{SensorSource, StreamConfig};
use framecast::sensors::SyntheticSensor;
use framecast::server::{ServerHandle, StreamServer};
use framecast::settings::SettingsStore;
use framecast::stream::multipart::{PartReader, SNAPSHOT_DISPOSITION, STREAM_CONTENT_TYPE};
use framecast::{CLIENT_CAPACITY, StreamError};

const PERIOD: Duration = Duration::from_millis(1000 / 14);

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<framecast::Result<()>>,
    settings_path: PathBuf,
    _dir: TempDir,
}

async fn start() -> Running {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let settings_path = dir.path().join("settings.yaml");
    let config = StreamConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        settings_path: Some(settings_path.clone()),
        sensor: SensorSource::Synthetic { scale: 0.01 },
        ..Default::default()
    };
    let server = StreamServer::bind(&config, SyntheticSensor::new().with_scale(0.01)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    Running { addr, handle, task, settings_path, _dir: dir }
}

/// Issue a GET and return (status code, body).
async fn get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let response = timeout(Duration::from_secs(5), reqwest::get(format!("http://{addr}{path}")))
        .await
        .unwrap()
        .unwrap();
    let status = response.status().as_u16();
    (status, response.bytes().await.unwrap().to_vec())
}

struct StreamClient {
    response: reqwest::Response,
    reader: PartReader,
}

impl StreamClient {
    async fn connect(addr: SocketAddr) -> Self {
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/mjpeg/1"))
            .header("Origin", "http://viewer.local")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["content-type"], STREAM_CONTENT_TYPE);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");

        let mut client = Self { response, reader: PartReader::new() };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !client.reader.take_preamble() {
            assert!(Instant::now() < deadline, "no stream preamble");
            client.fill().await;
        }
        client
    }

    async fn fill(&mut self) {
        let chunk = timeout(Duration::from_secs(2), self.response.chunk()).await.unwrap().unwrap();
        let chunk = chunk.expect("stream closed by server");
        self.reader.push(&chunk);
    }

    async fn next_part(&mut self) -> Vec<u8> {
        loop {
            if let Some(part) = self.reader.next_part().unwrap() {
                return part;
            }
            self.fill().await;
        }
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn stream_client_receives_well_formed_parts() {
    let server = start().await;
    let mut client = StreamClient::connect(server.addr).await;

    let started = Instant::now();
    let first = client.next_part().await;
    assert!(started.elapsed() < PERIOD * 2 + Duration::from_millis(500));
    assert!(SyntheticSensor::frame_sequence(&first).is_some());

    let mut last = 0;
    for _ in 0..5 {
        let part = client.next_part().await;
        let sequence = SyntheticSensor::frame_sequence(&part).expect("whole frame");
        assert!(sequence >= last);
        last = sequence;
    }

    server.handle.shutdown();
    assert!(server.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn disconnected_clients_are_dropped_and_workers_go_idle() {
    let server = start().await;
    let mut stays = StreamClient::connect(server.addr).await;
    let leaves = StreamClient::connect(server.addr).await;
    wait_until("two clients", || server.handle.active_clients() == 2).await;

    drop(leaves);
    wait_until("departed client removal", || server.handle.active_clients() == 1).await;
    for _ in 0..3 {
        stays.next_part().await;
    }

    drop(stays);
    wait_until("idle pipeline", || {
        server.handle.active_clients() == 0 && server.handle.power_states().is_idle()
    })
    .await;

    // Nothing is captured while idle
    let published = server.handle.published_sequence();
    tokio::time::sleep(PERIOD * 4).await;
    assert_eq!(server.handle.published_sequence(), published);

    // A new client wakes everything up again
    let mut again = StreamClient::connect(server.addr).await;
    again.next_part().await;
    assert!(!server.handle.power_states().is_idle());

    server.handle.shutdown();
    assert!(server.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn client_beyond_capacity_is_refused() {
    let server = start().await;
    let mut clients = Vec::new();
    for _ in 0..CLIENT_CAPACITY {
        clients.push(StreamClient::connect(server.addr).await);
    }
    wait_until("full registry", || server.handle.active_clients() == CLIENT_CAPACITY).await;

    let (status, body) = get(server.addr, "/mjpeg/1").await;
    assert_eq!((status, body.len()), (503, 0));
    assert_eq!(server.handle.active_clients(), CLIENT_CAPACITY);

    // Everyone already admitted keeps being served
    for client in &mut clients {
        client.next_part().await;
    }

    server.handle.shutdown();
    assert!(server.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn settings_can_be_read_and_changed() {
    let server = start().await;

    let (status, body) = get(server.addr, "/get").await;
    assert_eq!(status, 200);
    let settings: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(settings["quality"], 63);
    assert_eq!(settings["framesize"], 13);

    let (status, body) = get(server.addr, "/set?var=quality&val=20").await;
    assert_eq!((status, body.as_slice()), (200, &b"OK"[..]));
    let (_, body) = get(server.addr, "/get").await;
    let settings: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(settings["quality"], 20);

    assert_eq!(get(server.addr, "/set?var=quality&val=99").await.0, 400);
    assert_eq!(get(server.addr, "/set?var=sharpness&val=1").await.0, 400);
    assert_eq!(get(server.addr, "/set?var=vflip").await.0, 400);

    server.handle.shutdown();
    assert!(server.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn snapshot_and_diagnostic_page() {
    let server = start().await;

    let response = reqwest::get(format!("http://{}/jpg", server.addr)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    assert_eq!(response.headers()["content-disposition"], SNAPSHOT_DISPOSITION);
    let frame = response.bytes().await.unwrap();
    assert!(SyntheticSensor::frame_sequence(&frame).is_some());

    let (status, body) = get(server.addr, "/somewhere?x=1").await;
    assert_eq!(status, 200);
    let page = String::from_utf8(body).unwrap();
    assert!(page.starts_with("Server is running!\n\nURI: /somewhere\n"));
    assert!(page.contains("Arguments: 1\n"));
    assert!(page.contains("Counter: 1\n"));

    server.handle.shutdown();
    assert!(server.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn restart_request_stops_the_pipeline() {
    let server = start().await;
    let (status, body) = get(server.addr, "/restart").await;
    assert_eq!((status, body.as_slice()), (200, &b"OK"[..]));

    let outcome = timeout(Duration::from_secs(5), server.task).await.unwrap().unwrap();
    let err = outcome.unwrap_err();
    assert!(matches!(err, StreamError::RestartRequested { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn reset_forgets_stored_settings_and_restarts() {
    let server = start().await;
    assert_eq!(get(server.addr, "/set?var=quality&val=20").await.0, 200);
    let stored = SettingsStore::new(&server.settings_path).load().unwrap();
    assert_eq!(stored.overrides.get("quality"), Some(&20));

    let (status, body) = get(server.addr, "/reset").await;
    assert_eq!((status, body.as_slice()), (200, &b"OK"[..]));

    let outcome = timeout(Duration::from_secs(5), server.task).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(StreamError::RestartRequested { .. })));
    let stored = SettingsStore::new(&server.settings_path).load().unwrap();
    assert!(stored.overrides.is_empty());
    assert_eq!(stored.boot_count, 0);
}

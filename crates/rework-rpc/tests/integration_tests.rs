//! Integration tests for the rework-rpc binary.
//!
//! Each test spawns the binary, reads the advertised port and talks to it
//! through a TCP-backed engine.

use futures::future::join_all;
use rework_core::{EngineConfig, ReworkError, RpcEngine, TcpTransport};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

struct PeerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl PeerHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rework-rpc"))
}

/// Start the binary and wait for its `RPC_PORT=` line.
async fn start_peer() -> Result<PeerHandle, String> {
    let mut child = tokio::process::Command::new(binary_path())
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn rework-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read rework-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by rework-rpc".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(PeerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn connect(peer: &PeerHandle, timeout: Duration) -> RpcEngine {
    let config = EngineConfig::default().with_request_timeout(timeout);
    let transport = TcpTransport::connect(peer.addr(), &config)
        .await
        .expect("connect to rework-rpc");
    RpcEngine::new(transport, config)
}

#[tokio::test]
async fn test_ping_and_echo_over_tcp() {
    let peer = start_peer().await.expect("start rework-rpc");
    let engine = connect(&peer, Duration::from_secs(5)).await;
    let _listener = engine.listen();

    assert_eq!(engine.call("ping", Value::Null).await.unwrap(), json!("pong"));

    let payload = json!({"player": {"id": 7, "pos": [1.5, 2.0, -3.25]}});
    assert_eq!(engine.call("echo", payload.clone()).await.unwrap(), payload);

    peer.stop().await;
}

#[tokio::test]
async fn test_host_module_enabled_on_connect() {
    let peer = start_peer().await.expect("start rework-rpc");
    let engine = connect(&peer, Duration::from_secs(5)).await;
    let _listener = engine.listen();

    let status = engine.call("modules:status", Value::Null).await.unwrap();
    assert_eq!(status["host"]["enabled"], json!(true));

    peer.stop().await;
}

#[tokio::test]
async fn test_unhandled_event_times_out() {
    let peer = start_peer().await.expect("start rework-rpc");
    let engine = connect(&peer, Duration::from_millis(300)).await;
    let _listener = engine.listen();

    let err = engine.call("no:such:event", json!({})).await.unwrap_err();
    assert!(matches!(err, ReworkError::Timeout { .. }), "got {err:?}");
    assert_eq!(engine.pending_count(), 0);

    peer.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let peer = start_peer().await.expect("start rework-rpc");
    let engine = connect(&peer, Duration::from_secs(5)).await;
    let _listener = engine.listen();

    let calls = (0..16).map(|i| {
        let engine = engine.clone();
        async move { engine.call("echo", json!({ "i": i })).await }
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!({ "i": i }));
    }

    peer.stop().await;
}

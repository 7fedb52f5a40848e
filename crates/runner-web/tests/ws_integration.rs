use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use runner_web::config::FileConfig;
use runner_web::{AppState, Args, Gateway, GatewayConfig};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    workspace: tempfile::TempDir,
    objects: tempfile::TempDir,
}

async fn start_server() -> Result<TestServer> {
    let workspace = tempfile::tempdir().context("failed to create workspace dir")?;
    let objects = tempfile::tempdir().context("failed to create object dir")?;
    std::fs::write(workspace.path().join("README.md"), "# sandbox\n")?;
    std::fs::create_dir(workspace.path().join("src"))?;

    let args = Args::parse_from([
        "runner-web".to_string(),
        "--workspace-root".to_string(),
        workspace.path().display().to_string(),
        "--shell".to_string(),
        "/bin/sh".to_string(),
        "--storage-path".to_string(),
        objects.path().display().to_string(),
    ]);
    let config = GatewayConfig::merge(&args, FileConfig::default())?;
    let gateway = Gateway::build(&config)?;
    let state = Arc::clone(gateway.state());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(gateway.serve(listener, std::future::pending()));

    Ok(TestServer {
        addr,
        state,
        workspace,
        objects,
    })
}

async fn connect(addr: SocketAddr, host: &str) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    request.headers_mut().insert(
        "host",
        HeaderValue::from_str(host).map_err(|e| WsError::HttpFormat(e.into()))?,
    );
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

async fn send(ws: &mut Client, event: Value) -> Result<()> {
    ws.send(Message::Text(event.to_string().into())).await?;
    Ok(())
}

async fn next_event(ws: &mut Client) -> Result<Value> {
    timeout(Duration::from_secs(5), async {
        loop {
            let Some(msg) = ws.next().await else {
                bail!("websocket closed");
            };
            if let Message::Text(text) = msg? {
                return Ok(serde_json::from_str::<Value>(text.as_str())?);
            }
        }
    })
    .await
    .context("timed out waiting for server event")?
}

/// Skip terminal output until an event named `name` arrives.
async fn expect_event(ws: &mut Client, name: &str) -> Result<Value> {
    loop {
        let event = next_event(ws).await?;
        if event["event"] == name {
            return Ok(event);
        }
        if event["event"] != "terminal_output" {
            bail!("expected {name}, got {event}");
        }
    }
}

async fn wait_for_file(path: &Path) -> Result<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(bytes) = std::fs::read(path) {
            return Ok(bytes);
        }
        if Instant::now() > deadline {
            bail!("{} never appeared", path.display());
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_writes_files_and_drives_a_terminal() -> Result<()> {
    let server = start_server().await?;
    let host = format!("abc123.localhost:{}", server.addr.port());
    let mut ws = connect(server.addr, &host).await?;

    let ready = next_event(&mut ws).await?;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["workspace_id"], "abc123");
    assert_eq!(
        ready["entries"],
        json!([
            {"name": "src", "path": "src", "kind": "dir"},
            {"name": "README.md", "path": "README.md", "kind": "file"},
        ])
    );

    send(
        &mut ws,
        json!({
            "event": "write_file",
            "request_id": 1,
            "path": "index.js",
            "content": STANDARD.encode("console.log(1)"),
        }),
    )
    .await?;
    let written = next_event(&mut ws).await?;
    assert_eq!(written, json!({"event": "file_written", "request_id": 1, "path": "index.js"}));

    send(
        &mut ws,
        json!({"event": "read_file", "request_id": 2, "path": "index.js"}),
    )
    .await?;
    let content = next_event(&mut ws).await?;
    assert_eq!(content["event"], "file_content");
    assert_eq!(content["request_id"], 2);
    let decoded = STANDARD.decode(content["content"].as_str().unwrap_or_default())?;
    assert_eq!(decoded, b"console.log(1)");

    let replicated = wait_for_file(&server.objects.path().join("abc123/index.js")).await?;
    assert_eq!(replicated, b"console.log(1)");
    assert!(server.workspace.path().join("index.js").is_file());

    send(&mut ws, json!({"event": "open_terminal", "request_id": 3})).await?;
    let opened = expect_event(&mut ws, "terminal_opened").await?;
    assert_eq!(opened["request_id"], 3);
    let pid = opened["pid"].as_u64().context("missing pid")?;

    send(
        &mut ws,
        json!({"event": "terminal_input", "data": STANDARD.encode("echo hi\n")}),
    )
    .await?;

    let mut output = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !String::from_utf8_lossy(&output).contains("hi") {
        if Instant::now() > deadline {
            bail!("no terminal output containing hi: {:?}", String::from_utf8_lossy(&output));
        }
        let event = next_event(&mut ws).await?;
        if event["event"] == "terminal_output" {
            assert_eq!(event["pid"].as_u64(), Some(pid));
            output.extend(STANDARD.decode(event["data"].as_str().unwrap_or_default())?);
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_requests_keep_the_connection_alive() -> Result<()> {
    let server = start_server().await?;
    let mut ws = connect(server.addr, "abc123.localhost").await?;
    expect_event(&mut ws, "ready").await?;

    send(
        &mut ws,
        json!({"event": "read_file", "request_id": 7, "path": "../../etc/passwd"}),
    )
    .await?;
    let denied = next_event(&mut ws).await?;
    assert_eq!(denied["event"], "error");
    assert_eq!(denied["request_id"], 7);
    assert_eq!(denied["code"], "path_denied");

    send(
        &mut ws,
        json!({"event": "read_file", "request_id": 8, "path": "missing.txt"}),
    )
    .await?;
    let missing = next_event(&mut ws).await?;
    assert_eq!(missing["code"], "not_found");

    ws.send(Message::Text("{not json".to_string().into())).await?;
    let invalid = next_event(&mut ws).await?;
    assert_eq!(invalid["code"], "invalid_request");

    send(
        &mut ws,
        json!({"event": "list_directory", "request_id": 9, "path": "src"}),
    )
    .await?;
    let listing = next_event(&mut ws).await?;
    assert_eq!(listing["event"], "directory_listing");
    assert_eq!(listing["request_id"], 9);
    assert_eq!(listing["entries"], json!([]));

    let _ = ws.close(None).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_without_workspace_is_rejected() -> Result<()> {
    let server = start_server().await?;
    match connect(server.addr, "localhost").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        Err(other) => bail!("unexpected error: {other}"),
        Ok(_) => bail!("connection without workspace id was accepted"),
    }
    assert!(server.state.registry.is_empty().await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_tears_down_the_session() -> Result<()> {
    let server = start_server().await?;
    let mut ws = connect(server.addr, "abc123.localhost").await?;
    expect_event(&mut ws, "ready").await?;
    send(&mut ws, json!({"event": "open_terminal"})).await?;
    expect_event(&mut ws, "terminal_opened").await?;
    assert_eq!(server.state.registry.len().await, 1);

    let _ = ws.close(None).await;
    drop(ws);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.state.registry.is_empty().await {
        if Instant::now() > deadline {
            bail!("session was not removed after disconnect");
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_frame_ends_the_connection() -> Result<()> {
    let server = start_server().await?;
    let mut ws = connect(server.addr, "abc123.localhost").await?;
    expect_event(&mut ws, "ready").await?;
    assert_eq!(server.state.registry.len().await, 1);

    let padding = "x".repeat(2 * server.state.tuning.max_control_bytes);
    let frame = json!({"event": "read_file", "request_id": 1, "path": padding});
    // The server may reset the socket before the whole frame is written.
    let _ = ws.send(Message::Text(frame.to_string().into())).await;

    timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Text(text)) => {
                    let event: Value = serde_json::from_str(text.as_str())?;
                    assert_ne!(event["event"], "file_content", "oversized frame was handled");
                }
                Ok(_) => {}
            }
        }
        anyhow::Ok(())
    })
    .await
    .context("connection stayed open after an oversized frame")??;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.state.registry.is_empty().await {
        if Instant::now() > deadline {
            bail!("session was not removed after an oversized frame");
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthz_reports_sessions() -> Result<()> {
    let server = start_server().await?;
    let mut ws = connect(server.addr, "abc123.localhost").await?;
    expect_event(&mut ws, "ready").await?;

    let mut stream = TcpStream::connect(server.addr).await?;
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    let health: Value = serde_json::from_str(body)?;
    assert_eq!(health, json!({"status": "ok", "sessions": 1}));

    let _ = ws.close(None).await;
    Ok(())
}

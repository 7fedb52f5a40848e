use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use librunner::{
    FsObjectStore, HttpObjectStore, ObjectStore, RunnerError, SessionRegistry, SyncWriter,
    TerminalEvent, TerminalManager, WorkspaceFs, WorkspaceId, WorkspaceLayout,
};
use runner_protocol::{ClientEvent, ErrorCode, ServerEvent};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, StorageBackend, WsTuning};

const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every connection.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub terminals: Arc<TerminalManager>,
    pub sync: Option<SyncWriter>,
    pub layout: WorkspaceLayout,
    pub tuning: WsTuning,
}

/// A configured gateway, ready to serve.
pub struct Gateway {
    state: Arc<AppState>,
    cors: CorsLayer,
    sync_worker: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Build the gateway and start the replication worker, if storage is
    /// configured. Must run inside a tokio runtime.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let store = open_store(&config.storage.backend)?;
        let (sync, sync_worker) = match store {
            Some(store) => {
                let (writer, worker) = SyncWriter::spawn(store, config.storage.sync.clone());
                (Some(writer), Some(worker))
            }
            None => (None, None),
        };

        let registry = Arc::new(SessionRegistry::new());
        let layout = WorkspaceLayout::new(&config.workspace_root, config.layout);
        let terminals = Arc::new(TerminalManager::new(
            Arc::clone(&registry),
            layout.clone(),
            config.terminal.clone(),
        ));

        Ok(Self {
            state: Arc::new(AppState {
                registry,
                terminals,
                sync,
                layout,
                tuning: config.tuning.clone(),
            }),
            cors: build_cors(&config.allow_origins)?,
            sync_worker,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_connect))
            .route("/healthz", get(healthz))
            .layer(self.cors.clone())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` resolves, then close every session and give
    /// queued replication jobs a chance to finish.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("web server failed")?;

        let Self {
            state, sync_worker, ..
        } = self;
        for session in state.registry.list().await {
            state.terminals.close_session(&session.session_id).await;
        }
        drop(state);

        if let Some(worker) = sync_worker {
            match tokio::time::timeout(SYNC_DRAIN_TIMEOUT, worker).await {
                Ok(_) => info!("replication queue drained"),
                Err(_) => warn!("replication queue did not drain before shutdown"),
            }
        }
        Ok(())
    }
}

fn open_store(backend: &StorageBackend) -> Result<Option<Arc<dyn ObjectStore>>> {
    let store: Arc<dyn ObjectStore> = match backend {
        StorageBackend::None => {
            info!("storage replication disabled");
            return Ok(None);
        }
        StorageBackend::Fs { path } => {
            info!(path = %path.display(), "replicating to local directory");
            Arc::new(FsObjectStore::new(path))
        }
        StorageBackend::Http {
            endpoint,
            bearer_token,
        } => {
            info!(endpoint = %endpoint, "replicating to http object store");
            Arc::new(
                HttpObjectStore::new(endpoint, bearer_token.clone(), STORE_REQUEST_TIMEOUT)
                    .with_context(|| format!("invalid storage endpoint {endpoint}"))?,
            )
        }
    };
    Ok(Some(store))
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len().await,
    }))
}

/// Derive the workspace id from the host the client addressed.
fn workspace_from_headers(headers: &HeaderMap, trust_forwarded: bool) -> Option<WorkspaceId> {
    let forwarded = if trust_forwarded {
        headers.get("x-forwarded-host")
    } else {
        None
    };
    let raw = forwarded.or_else(|| headers.get(header::HOST))?;
    let host = raw.to_str().ok()?.split(',').next()?.trim();
    WorkspaceId::from_host(host)
}

async fn ws_connect(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(workspace_id) = workspace_from_headers(&headers, state.tuning.trust_forwarded_host)
    else {
        warn!(host = ?headers.get(header::HOST), "rejecting connection without workspace id");
        return (
            StatusCode::BAD_REQUEST,
            "workspace id could not be derived from host",
        )
            .into_response();
    };
    // Oversized frames fail the read and end the connection.
    ws.max_message_size(state.tuning.max_control_bytes)
        .on_upgrade(move |socket| connection_task(socket, state, workspace_id))
}

async fn connection_task(socket: WebSocket, state: Arc<AppState>, workspace_id: WorkspaceId) {
    let session_id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = connection_inner(socket, &state, &session_id, &workspace_id).await {
        warn!(session_id = %session_id, error = %err, "connection closed with error");
    }
    state.terminals.close_session(&session_id).await;
}

async fn connection_inner(
    socket: WebSocket,
    state: &Arc<AppState>,
    session_id: &str,
    workspace_id: &WorkspaceId,
) -> Result<()> {
    let root = state.layout.root_for(workspace_id);
    let fs = WorkspaceFs::open(&root)
        .await
        .with_context(|| format!("failed to open workspace {}", root.display()))?;
    let cancel = state.registry.open(session_id, workspace_id).await;

    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(state.tuning.outbound_queue);
    let (term_tx, term_rx) = mpsc::channel(state.tuning.terminal_buffer);
    tokio::spawn(write_loop(ws_tx, out_rx, term_rx, cancel.clone()));

    let entries = match fs.list_dir("").await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "initial listing failed");
            Vec::new()
        }
    };
    out_tx
        .send(ServerEvent::Ready {
            workspace_id: workspace_id.to_string(),
            entries,
        })
        .await
        .context("socket writer stopped")?;
    info!(session_id = %session_id, workspace_id = %workspace_id, "connection identified");

    let conn = Connection {
        state: state.as_ref(),
        fs,
        session_id,
        workspace_id,
        out_tx,
        term_tx,
    };

    // Events are handled one at a time so file writes apply in arrival order.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_msg = ws_rx.next() => {
                let Some(msg) = maybe_msg else {
                    break;
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(session_id = %session_id, error = %err, "socket read failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => conn.handle_text(text.as_str()).await?,
                    Message::Binary(bytes) => {
                        conn.state.terminals.write(session_id, bytes.to_vec()).await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    info!(session_id = %session_id, "connection closed");
    Ok(())
}

/// Forward replies and terminal events to the socket until the session is
/// cancelled. Terminal events share one channel, so a process's output keeps
/// the order it was produced in.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerEvent>,
    mut term_rx: mpsc::Receiver<TerminalEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = out_rx.recv() => event,
            Some(event) = term_rx.recv() => terminal_event(event),
            else => break,
        };
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode server event");
                continue;
            }
        };
        if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
            debug!(error = %err, "socket write failed");
            break;
        }
    }
    let _ = ws_tx.close().await;
}

fn terminal_event(event: TerminalEvent) -> ServerEvent {
    match event {
        TerminalEvent::Output { pid, data } => ServerEvent::TerminalOutput { pid, data },
        TerminalEvent::Exited { pid, exit_code } => ServerEvent::TerminalExited { pid, exit_code },
    }
}

/// One identified connection.
struct Connection<'a> {
    state: &'a AppState,
    fs: WorkspaceFs,
    session_id: &'a str,
    workspace_id: &'a WorkspaceId,
    out_tx: mpsc::Sender<ServerEvent>,
    term_tx: mpsc::Sender<TerminalEvent>,
}

impl Connection<'_> {
    async fn handle_text(&self, text: &str) -> Result<()> {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.dispatch(event).await,
            Err(err) => {
                debug!(session_id = %self.session_id, error = %err, "invalid client event");
                self.send(ServerEvent::Error {
                    request_id: None,
                    code: ErrorCode::InvalidRequest,
                    message: format!("invalid event: {err}"),
                })
                .await
            }
        }
    }

    async fn dispatch(&self, event: ClientEvent) -> Result<()> {
        let request_id = event.request_id();
        let reply = match event {
            ClientEvent::ListDirectory { path, .. } => {
                self.fs
                    .list_dir(&path)
                    .await
                    .map(|entries| {
                        Some(ServerEvent::DirectoryListing {
                            request_id,
                            path,
                            entries,
                        })
                    })
            }
            ClientEvent::ReadFile { path, .. } => self.fs.read_file(&path).await.map(|content| {
                Some(ServerEvent::FileContent {
                    request_id,
                    path,
                    content,
                })
            }),
            ClientEvent::WriteFile { path, content, .. } => {
                self.write_file(&path, content).await.map(|written| {
                    request_id.map(|_| ServerEvent::FileWritten {
                        request_id,
                        path: written,
                    })
                })
            }
            ClientEvent::OpenTerminal { .. } => self
                .state
                .terminals
                .create(self.session_id, self.workspace_id, self.term_tx.clone())
                .await
                .map(|handle| {
                    Some(ServerEvent::TerminalOpened {
                        request_id,
                        pid: handle.pid,
                    })
                }),
            ClientEvent::TerminalInput { data } => {
                self.state.terminals.write(self.session_id, data).await;
                Ok(None)
            }
            ClientEvent::ResizeTerminal { cols, rows } => self
                .state
                .terminals
                .resize(self.session_id, cols, rows)
                .await
                .map(|_| None),
            ClientEvent::CloseTerminal => {
                self.state.terminals.terminate(self.session_id).await;
                Ok(None)
            }
        };

        match reply {
            Ok(Some(event)) => self.send(event).await,
            Ok(None) => Ok(()),
            Err(err) => self.send_error(request_id, &err).await,
        }
    }

    /// Write locally, then hand the same bytes to replication without
    /// waiting for it.
    async fn write_file(&self, path: &str, content: Vec<u8>) -> Result<String, RunnerError> {
        let written = self.fs.write_file(path, &content).await?;
        if let Some(sync) = &self.state.sync {
            sync.enqueue(self.workspace_id, &written, content);
        }
        Ok(written)
    }

    async fn send_error(&self, request_id: Option<u64>, err: &RunnerError) -> Result<()> {
        let (code, message) = err.to_error_code();
        debug!(session_id = %self.session_id, error = %err, ?code, "request failed");
        self.send(ServerEvent::Error {
            request_id,
            code,
            message,
        })
        .await
    }

    async fn send(&self, event: ServerEvent) -> Result<()> {
        self.out_tx
            .send(event)
            .await
            .context("socket writer stopped")
    }
}

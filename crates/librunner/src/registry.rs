use std::collections::HashMap;
use std::time::SystemTime;

use runner_protocol::SessionId;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::terminal::{Terminal, TerminalId};
use crate::workspace::WorkspaceId;

/// Server-side state of one connection.
struct SessionEntry {
    workspace_id: WorkspaceId,
    cancel: CancellationToken,
    terminal: Option<Terminal>,
    created_at: SystemTime,
}

impl SessionEntry {
    fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            cancel: CancellationToken::new(),
            terminal: None,
            created_at: SystemTime::now(),
        }
    }
}

/// Snapshot of a session for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub terminal_pid: Option<u32>,
    pub created_at: SystemTime,
}

/// Registry of live sessions, shared by the gateway and the terminal manager.
///
/// All mutation happens under one lock. Terminal handles are moved *out* of
/// the registry before they are killed, so whichever caller takes a terminal
/// first is the only one that can release it.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session and return its cancellation token. Opening an
    /// already registered session returns the existing token.
    pub async fn open(&self, session_id: &str, workspace_id: &WorkspaceId) -> CancellationToken {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id = %session_id, workspace_id = %workspace_id, "session opened");
                SessionEntry::new(workspace_id.clone())
            });
        entry.cancel.clone()
    }

    /// Remove a session, cancelling its token. The terminal, if any, is
    /// handed back to the caller to kill.
    pub async fn close(&self, session_id: &str) -> Option<Terminal> {
        let entry = self.sessions.lock().await.remove(session_id)?;
        entry.cancel.cancel();
        info!(session_id = %session_id, workspace_id = %entry.workspace_id, "session closed");
        entry.terminal
    }

    /// Put `terminal` into the session's slot and return the terminal it
    /// displaced. Fails with the terminal itself if the session is gone.
    pub async fn install_terminal(
        &self,
        session_id: &str,
        terminal: Terminal,
    ) -> Result<Option<Terminal>, Terminal> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(entry) => Ok(entry.terminal.replace(terminal)),
            None => Err(terminal),
        }
    }

    /// Move the session's terminal out of the registry.
    pub async fn take_terminal(&self, session_id: &str) -> Option<Terminal> {
        self.sessions
            .lock()
            .await
            .get_mut(session_id)
            .and_then(|entry| entry.terminal.take())
    }

    /// Release the terminal after its process exited on its own. Only the
    /// terminal registered as `terminal_id` under `session_id` is removed; if
    /// it was already taken or replaced this is a no-op.
    pub async fn release_exited(
        &self,
        session_id: &str,
        terminal_id: TerminalId,
    ) -> Option<Terminal> {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "exited terminal's session already closed");
            return None;
        };
        match &entry.terminal {
            Some(t) if t.id() == terminal_id => entry.terminal.take(),
            _ => {
                debug!(session_id = %session_id, terminal_id, "exited terminal already released");
                None
            }
        }
    }

    pub async fn session_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.cancel.clone())
    }

    /// Clone the input channel of the session's live terminal.
    pub async fn input_sender(&self, session_id: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .and_then(|entry| entry.terminal.as_ref())
            .map(|t| t.input_sender())
    }

    /// Run `f` against the session's live terminal while holding the lock.
    pub async fn with_terminal<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Terminal) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .get_mut(session_id)
            .and_then(|entry| entry.terminal.as_mut())
            .map(f)
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn has_terminal(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .is_some_and(|entry| entry.terminal.is_some())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                workspace_id: entry.workspace_id.clone(),
                terminal_pid: entry.terminal.as_ref().map(|t| t.pid()),
                created_at: entry.created_at,
            })
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use portable_pty::{Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::registry::SessionRegistry;
use crate::workspace::{WorkspaceId, WorkspaceLayout};

const READ_CHUNK_BYTES: usize = 4096;
const EXIT_POLL: Duration = Duration::from_millis(20);

/// The child is shared by the exit watcher, which reaps it, and by
/// [`Terminal::kill`]. Both hold the lock while touching the pid.
type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// Registration generation of a terminal. Unlike a pid it is never reused
/// within a process, so an exit notification can always tell whether the
/// registry slot still holds the terminal that exited.
pub type TerminalId = u64;

/// Events a terminal delivers to its sink, in the order the process
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output { pid: u32, data: Vec<u8> },
    Exited { pid: u32, exit_code: Option<u32> },
}

/// Bounded channel that receives a terminal's events. When it is full the
/// reader stops consuming PTY output until the receiver catches up.
pub type OutputSink = mpsc::Sender<TerminalEvent>;

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    /// Pending keystroke writes per terminal.
    pub input_queue: usize,
    /// How long an exit notification waits for the last output to drain.
    pub exit_drain: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            args: Vec::new(),
            cols: 100,
            rows: 24,
            term: "xterm".to_string(),
            input_queue: 64,
            exit_drain: Duration::from_secs(2),
        }
    }
}

/// Identifies a spawned terminal to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalHandle {
    pub terminal_id: TerminalId,
    pub pid: u32,
}

/// A live shell process on a PTY. Owned by the session registry.
pub struct Terminal {
    id: TerminalId,
    pid: u32,
    master: Box<dyn MasterPty + Send>,
    input_tx: mpsc::Sender<Vec<u8>>,
    child: SharedChild,
    exited: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Terminal {
    pub fn id(&self) -> TerminalId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn input_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.input_tx.clone()
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), RunnerError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RunnerError::Pty(e.to_string()))
    }

    /// Stop output delivery and kill the process. A process that already
    /// exited is not signalled. Returns whether a signal was sent.
    async fn kill(self) -> bool {
        self.cancel.cancel();
        let Terminal {
            pid, child, exited, ..
        } = self;
        tokio::task::spawn_blocking(move || signal_unless_exited(&child, &exited, pid))
            .await
            .unwrap_or(false)
    }
}

fn signal_unless_exited(child: &SharedChild, exited: &AtomicBool, pid: u32) -> bool {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if exited.load(Ordering::Acquire) {
        return false;
    }
    match child.kill() {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "kill failed");
            false
        }
    }
}

/// Poll the child until it exits. The pid is reaped and `exited` is set in
/// the same critical section, so a kill never targets a reaped pid.
async fn reap(child: &SharedChild, exited: &AtomicBool) -> std::io::Result<ExitStatus> {
    loop {
        {
            let mut guard = child.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.try_wait() {
                Ok(Some(status)) => {
                    exited.store(true, Ordering::Release);
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => {
                    exited.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// Spawns and supervises one shell per session.
pub struct TerminalManager {
    registry: Arc<SessionRegistry>,
    layout: WorkspaceLayout,
    config: TerminalConfig,
    next_id: AtomicU64,
}

impl TerminalManager {
    pub fn new(registry: Arc<SessionRegistry>, layout: WorkspaceLayout, config: TerminalConfig) -> Self {
        Self {
            registry,
            layout,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Spawn a shell in the workspace directory and register it under
    /// `session_id`, which must already be open in the registry. A terminal
    /// already live for the session is torn down first. Every chunk the
    /// shell prints goes to `sink` in order.
    pub async fn create(
        &self,
        session_id: &str,
        workspace_id: &WorkspaceId,
        sink: OutputSink,
    ) -> Result<TerminalHandle, RunnerError> {
        let Some(session_cancel) = self.registry.session_token(session_id).await else {
            return Err(session_closed());
        };
        if self.terminate(session_id).await {
            info!(session_id = %session_id, "replacing live terminal");
        }

        let cwd = self.layout.root_for(workspace_id);
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| RunnerError::SpawnFailure(format!("{}: {e}", cwd.display())))?;

        let cancel = session_cancel.child_token();
        let terminal_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let SpawnedPty {
            master,
            child,
            reader,
            writer,
        } = spawn_pty(&self.config, &cwd)?;
        let pid = child.process_id().unwrap_or_default();
        let child: SharedChild = Arc::new(Mutex::new(child));
        let exited = Arc::new(AtomicBool::new(false));

        let (input_tx, input_rx) = mpsc::channel(self.config.input_queue.max(1));
        tokio::task::spawn_blocking(move || input_loop(writer, input_rx));

        let reader_task = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || output_loop(reader, pid, sink, cancel))
        };

        let terminal = Terminal {
            id: terminal_id,
            pid,
            master,
            input_tx,
            child: Arc::clone(&child),
            exited: Arc::clone(&exited),
            cancel: cancel.clone(),
        };

        match self.registry.install_terminal(session_id, terminal).await {
            Ok(Some(previous)) => {
                previous.kill().await;
            }
            Ok(None) => {}
            Err(orphan) => {
                orphan.kill().await;
                tokio::spawn(async move {
                    let _ = reap(&child, &exited).await;
                });
                return Err(session_closed());
            }
        }

        // The watcher starts only after the terminal is registered, so an
        // immediate exit still finds its slot.
        tokio::spawn(watch_exit(ExitWatch {
            registry: Arc::clone(&self.registry),
            session_id: session_id.to_string(),
            terminal_id,
            pid,
            child,
            exited,
            reader_task,
            sink,
            cancel,
            drain: self.config.exit_drain,
        }));

        info!(
            session_id = %session_id,
            workspace_id = %workspace_id,
            pid,
            terminal_id,
            "terminal spawned"
        );
        Ok(TerminalHandle { terminal_id, pid })
    }

    /// Forward keystrokes to the session's terminal. Returns `false` without
    /// error when the session has no live terminal.
    pub async fn write(&self, session_id: &str, data: Vec<u8>) -> bool {
        let Some(input) = self.registry.input_sender(session_id).await else {
            debug!(session_id = %session_id, "input for session without terminal dropped");
            return false;
        };
        input.send(data).await.is_ok()
    }

    /// Resize the session's PTY. Returns `Ok(false)` when no terminal is live.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<bool, RunnerError> {
        match self
            .registry
            .with_terminal(session_id, |t| t.resize(cols, rows))
            .await
        {
            Some(result) => result.map(|()| true),
            None => Ok(false),
        }
    }

    /// Kill the session's terminal and drop it from the registry.
    ///
    /// Idempotent: concurrent or repeated calls, and calls racing the
    /// process's own exit, find the slot empty and return `false`.
    pub async fn terminate(&self, session_id: &str) -> bool {
        let Some(terminal) = self.registry.take_terminal(session_id).await else {
            return false;
        };
        let pid = terminal.pid();
        let signalled = terminal.kill().await;
        info!(session_id = %session_id, pid, signalled, "terminal terminated");
        true
    }

    /// Tear down everything the session owns: its terminal and its registry
    /// entry. Safe when no terminal was ever opened.
    pub async fn close_session(&self, session_id: &str) {
        self.terminate(session_id).await;
        if let Some(terminal) = self.registry.close(session_id).await {
            terminal.kill().await;
        }
    }
}

fn session_closed() -> RunnerError {
    RunnerError::Pty("session closed".to_string())
}

struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

fn spawn_pty(config: &TerminalConfig, cwd: &Path) -> Result<SpawnedPty, RunnerError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| RunnerError::SpawnFailure(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&config.shell);
    cmd.args(&config.args);
    cmd.cwd(cwd);
    cmd.env("TERM", &config.term);

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| RunnerError::SpawnFailure(format!("{}: {e}", config.shell)))?;

    // Only the master side stays open here; the reader sees EOF once the
    // child's copies of the slave are gone.
    drop(pair.slave);

    let io = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    match io {
        Ok((reader, writer)) => Ok(SpawnedPty {
            master: pair.master,
            child,
            reader,
            writer,
        }),
        Err(e) => {
            let _ = child.kill();
            Err(RunnerError::Pty(e.to_string()))
        }
    }
}

fn input_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!(error = %e, "pty write failed");
            break;
        }
    }
}

fn output_loop(
    mut reader: Box<dyn Read + Send>,
    pid: u32,
    sink: OutputSink,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let event = TerminalEvent::Output {
                    pid,
                    data: buf[..n].to_vec(),
                };
                if sink.blocking_send(event).is_err() {
                    debug!(pid, "output sink closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO is how Linux reports a hung-up PTY.
                debug!(pid, error = %e, "pty read ended");
                break;
            }
        }
    }
}

struct ExitWatch {
    registry: Arc<SessionRegistry>,
    session_id: String,
    terminal_id: TerminalId,
    pid: u32,
    child: SharedChild,
    exited: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    sink: OutputSink,
    cancel: CancellationToken,
    drain: Duration,
}

async fn watch_exit(watch: ExitWatch) {
    let ExitWatch {
        registry,
        session_id,
        terminal_id,
        pid,
        child,
        exited,
        reader_task,
        sink,
        cancel,
        drain,
    } = watch;

    let exit_code = match reap(&child, &exited).await {
        Ok(status) => Some(status.exit_code()),
        Err(e) => {
            warn!(session_id = %session_id, pid, error = %e, "waiting on terminal failed");
            None
        }
    };

    if tokio::time::timeout(drain, reader_task).await.is_err() {
        debug!(session_id = %session_id, pid, "output still draining after exit");
    }

    // Keyed by the session the terminal was registered under, guarded by its
    // generation: a terminate that already took the slot wins.
    let Some(terminal) = registry.release_exited(&session_id, terminal_id).await else {
        return;
    };
    drop(terminal);
    info!(session_id = %session_id, pid, exit_code = ?exit_code, "terminal exited");

    if !cancel.is_cancelled() {
        let _ = sink.send(TerminalEvent::Exited { pid, exit_code }).await;
    }
}

use anyhow::{Context, Result, bail};
use clap::Parser;
use librunner::{LayoutKind, RetryPolicy, SyncConfig, TerminalConfig};
use runner_protocol::MAX_CONTROL_FRAME_BYTES;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:3001";
const DEFAULT_WORKSPACE_ROOT: &str = "/workspace";

#[derive(Parser, Debug, Default)]
#[command(name = "runner-web", version, about = "WebSocket gateway for sandboxed coding workspaces")]
pub struct Args {
    /// TOML configuration file. Flags override values from the file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub listen: Option<SocketAddr>,

    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// `shared` or `per_workspace`.
    #[arg(long)]
    pub layout: Option<String>,

    #[arg(long)]
    pub shell: Option<String>,

    #[arg(long = "shell-arg")]
    pub shell_args: Vec<String>,

    #[arg(long)]
    pub cols: Option<u16>,

    #[arg(long)]
    pub rows: Option<u16>,

    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,

    /// Derive the workspace id from `X-Forwarded-Host` when present.
    #[arg(long)]
    pub trust_forwarded_host: bool,

    /// Replicate written files into this directory.
    #[arg(long, conflicts_with = "storage_endpoint")]
    pub storage_path: Option<PathBuf>,

    /// Replicate written files with HTTP PUT against this endpoint.
    #[arg(long)]
    pub storage_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    listen: Option<SocketAddr>,
    workspace_root: Option<PathBuf>,
    layout: Option<LayoutKind>,
    shell: Option<String>,
    shell_args: Option<Vec<String>>,
    cols: Option<u16>,
    rows: Option<u16>,
    outbound_queue: Option<usize>,
    terminal_buffer: Option<usize>,
    max_control_bytes: Option<usize>,
    allow_origins: Option<Vec<String>>,
    trust_forwarded_host: Option<bool>,
    storage: Option<StorageFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageFileConfig {
    kind: Option<StorageKind>,
    path: Option<PathBuf>,
    endpoint: Option<String>,
    bearer_token_env: Option<String>,
    key_prefix: Option<String>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StorageKind {
    None,
    Fs,
    Http,
}

/// Per-connection buffering and limits.
#[derive(Debug, Clone)]
pub struct WsTuning {
    /// Replies queued for the socket writer.
    pub outbound_queue: usize,
    /// Terminal chunks queued before the PTY reader pauses.
    pub terminal_buffer: usize,
    pub max_control_bytes: usize,
    pub trust_forwarded_host: bool,
}

impl Default for WsTuning {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            terminal_buffer: 64,
            max_control_bytes: MAX_CONTROL_FRAME_BYTES,
            trust_forwarded_host: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    None,
    Fs { path: PathBuf },
    Http {
        endpoint: String,
        bearer_token: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub workspace_root: PathBuf,
    pub layout: LayoutKind,
    pub terminal: TerminalConfig,
    pub tuning: WsTuning,
    pub allow_origins: Vec<String>,
    pub storage: StorageConfig,
}

impl GatewayConfig {
    pub fn load(args: &Args) -> Result<Self> {
        let file_cfg = if let Some(path) = &args.config {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            FileConfig::default()
        };
        Self::merge(args, file_cfg)
    }

    pub fn merge(args: &Args, file_cfg: FileConfig) -> Result<Self> {
        let listen = match args.listen.or(file_cfg.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN.parse()?,
        };
        let layout = match &args.layout {
            Some(raw) => parse_layout(raw)?,
            None => file_cfg.layout.unwrap_or_default(),
        };

        let defaults = TerminalConfig::default();
        let terminal = TerminalConfig {
            shell: args
                .shell
                .clone()
                .or(file_cfg.shell)
                .unwrap_or(defaults.shell),
            args: if args.shell_args.is_empty() {
                file_cfg.shell_args.unwrap_or(defaults.args)
            } else {
                args.shell_args.clone()
            },
            cols: args.cols.or(file_cfg.cols).unwrap_or(defaults.cols),
            rows: args.rows.or(file_cfg.rows).unwrap_or(defaults.rows),
            ..defaults
        };
        if terminal.cols == 0 || terminal.rows == 0 {
            bail!("terminal cols/rows must be > 0");
        }

        let tuning_defaults = WsTuning::default();
        let tuning = WsTuning {
            outbound_queue: file_cfg
                .outbound_queue
                .unwrap_or(tuning_defaults.outbound_queue),
            terminal_buffer: file_cfg
                .terminal_buffer
                .unwrap_or(tuning_defaults.terminal_buffer),
            max_control_bytes: file_cfg
                .max_control_bytes
                .unwrap_or(tuning_defaults.max_control_bytes),
            trust_forwarded_host: args.trust_forwarded_host
                || file_cfg.trust_forwarded_host.unwrap_or(false),
        };
        if tuning.outbound_queue == 0 || tuning.terminal_buffer == 0 {
            bail!("outbound_queue and terminal_buffer must be > 0");
        }

        let allow_origins = if args.allow_origins.is_empty() {
            file_cfg
                .allow_origins
                .unwrap_or_else(|| vec!["*".to_string()])
        } else {
            args.allow_origins.clone()
        };

        Ok(Self {
            listen,
            workspace_root: args
                .workspace_root
                .clone()
                .or(file_cfg.workspace_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_ROOT)),
            layout,
            terminal,
            tuning,
            allow_origins,
            storage: storage_config(args, file_cfg.storage.unwrap_or_default())?,
        })
    }
}

fn parse_layout(raw: &str) -> Result<LayoutKind> {
    match raw {
        "shared" => Ok(LayoutKind::Shared),
        "per_workspace" | "per-workspace" => Ok(LayoutKind::PerWorkspace),
        other => bail!("invalid --layout value: {other} (expected shared or per_workspace)"),
    }
}

fn storage_config(args: &Args, file_cfg: StorageFileConfig) -> Result<StorageConfig> {
    let retry_defaults = RetryPolicy::default();
    let sync = SyncConfig {
        retry: RetryPolicy {
            max_attempts: file_cfg.max_attempts.unwrap_or(retry_defaults.max_attempts),
            base_delay: file_cfg
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_delay),
            max_delay: file_cfg
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
        },
        key_prefix: file_cfg.key_prefix,
        max_concurrent: file_cfg
            .max_concurrent
            .unwrap_or(SyncConfig::default().max_concurrent),
    };

    let kind = if args.storage_path.is_some() {
        StorageKind::Fs
    } else if args.storage_endpoint.is_some() {
        StorageKind::Http
    } else {
        file_cfg.kind.unwrap_or(StorageKind::None)
    };

    let backend = match kind {
        StorageKind::None => StorageBackend::None,
        StorageKind::Fs => {
            let Some(path) = args.storage_path.clone().or(file_cfg.path) else {
                bail!("storage kind fs requires storage.path");
            };
            StorageBackend::Fs { path }
        }
        StorageKind::Http => {
            let Some(endpoint) = args.storage_endpoint.clone().or(file_cfg.endpoint) else {
                bail!("storage kind http requires storage.endpoint");
            };
            let bearer_token = match &file_cfg.bearer_token_env {
                Some(var) => Some(std::env::var(var).with_context(|| {
                    format!("storage.bearer_token_env names {var}, which is not set")
                })?),
                None => None,
            };
            StorageBackend::Http {
                endpoint,
                bearer_token,
            }
        }
    };

    Ok(StorageConfig { backend, sync })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_file(raw: &str) -> FileConfig {
        toml::from_str(raw).expect("valid config")
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let cfg = GatewayConfig::merge(&Args::default(), FileConfig::default()).unwrap();
        assert_eq!(cfg.listen.to_string(), "0.0.0.0:3001");
        assert_eq!(cfg.workspace_root, PathBuf::from("/workspace"));
        assert_eq!(cfg.layout, LayoutKind::Shared);
        assert_eq!(cfg.terminal.shell, "bash");
        assert_eq!((cfg.terminal.cols, cfg.terminal.rows), (100, 24));
        assert_eq!(cfg.tuning.max_control_bytes, MAX_CONTROL_FRAME_BYTES);
        assert_eq!(cfg.allow_origins, vec!["*".to_string()]);
        assert!(!cfg.tuning.trust_forwarded_host);
        assert_eq!(cfg.storage.backend, StorageBackend::None);
        assert_eq!(cfg.storage.sync.retry.max_attempts, 5);
    }

    #[test]
    fn file_values_apply() {
        let file = parse_file(
            r#"
            listen = "127.0.0.1:9000"
            workspace_root = "/srv/ws"
            layout = "per_workspace"
            shell = "zsh"
            shell_args = ["-l"]
            outbound_queue = 32
            allow_origins = ["https://ide.example.com"]

            [storage]
            kind = "fs"
            path = "/var/lib/runner/objects"
            key_prefix = "code"
            max_attempts = 2
            base_delay_ms = 50
            "#,
        );
        let cfg = GatewayConfig::merge(&Args::default(), file).unwrap();
        assert_eq!(cfg.listen.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.layout, LayoutKind::PerWorkspace);
        assert_eq!(cfg.terminal.shell, "zsh");
        assert_eq!(cfg.terminal.args, vec!["-l".to_string()]);
        assert_eq!(cfg.tuning.outbound_queue, 32);
        assert_eq!(
            cfg.storage.backend,
            StorageBackend::Fs {
                path: PathBuf::from("/var/lib/runner/objects")
            }
        );
        assert_eq!(cfg.storage.sync.key_prefix.as_deref(), Some("code"));
        assert_eq!(cfg.storage.sync.retry.max_attempts, 2);
        assert_eq!(cfg.storage.sync.retry.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn flags_override_file() {
        let file = parse_file(
            r#"
            shell = "zsh"
            layout = "per_workspace"
            [storage]
            kind = "fs"
            path = "/from/file"
            "#,
        );
        let args = Args::parse_from([
            "runner-web",
            "--shell",
            "sh",
            "--layout",
            "shared",
            "--storage-endpoint",
            "http://storage.local/bucket",
            "--cols",
            "120",
        ]);
        let cfg = GatewayConfig::merge(&args, file).unwrap();
        assert_eq!(cfg.terminal.shell, "sh");
        assert_eq!(cfg.terminal.cols, 120);
        assert_eq!(cfg.layout, LayoutKind::Shared);
        assert_eq!(
            cfg.storage.backend,
            StorageBackend::Http {
                endpoint: "http://storage.local/bucket".to_string(),
                bearer_token: None,
            }
        );
    }

    #[test]
    fn incomplete_storage_is_rejected() {
        let file = parse_file("[storage]\nkind = \"http\"\n");
        assert!(GatewayConfig::merge(&Args::default(), file).is_err());

        let file = parse_file("[storage]\nkind = \"fs\"\n");
        assert!(GatewayConfig::merge(&Args::default(), file).is_err());
    }

    #[test]
    fn missing_bearer_token_env_is_an_error() {
        let file = parse_file(
            r#"
            [storage]
            kind = "http"
            endpoint = "http://storage.local"
            bearer_token_env = "RUNNER_WEB_TEST_TOKEN_THAT_IS_NEVER_SET"
            "#,
        );
        assert!(GatewayConfig::merge(&Args::default(), file).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let args = Args::parse_from(["runner-web", "--layout", "sideways"]);
        assert!(GatewayConfig::merge(&args, FileConfig::default()).is_err());

        assert!(toml::from_str::<FileConfig>("unknown_key = 1").is_err());

        let file = parse_file("terminal_buffer = 0");
        assert!(GatewayConfig::merge(&Args::default(), file).is_err());
    }
}

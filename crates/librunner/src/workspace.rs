use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RunnerError;

const MAX_LABEL_LEN: usize = 63;

/// Identity of a workspace, taken from the leading DNS label of the host a
/// client connected to. Always a valid lowercase DNS label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn parse(raw: &str) -> Result<Self, RunnerError> {
        let label = raw.to_ascii_lowercase();
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            return Err(RunnerError::InvalidWorkspaceId(raw.to_string()));
        }
        Ok(Self(label))
    }

    /// Derive the workspace id from a `Host` header value such as
    /// `abc123.sandbox.example.com:443`. A bare host without a subdomain
    /// yields `None`.
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.trim();
        let without_port = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        let (label, rest) = without_port.split_once('.')?;
        if rest.is_empty() {
            return None;
        }
        Self::parse(label).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How workspace ids map onto directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Every workspace shares the base directory. One gateway per workspace
    /// container.
    #[default]
    Shared,
    /// Each workspace lives in `<base>/<workspace id>`.
    PerWorkspace,
}

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    base: PathBuf,
    kind: LayoutKind,
}

impl WorkspaceLayout {
    pub fn new(base: impl Into<PathBuf>, kind: LayoutKind) -> Self {
        Self {
            base: base.into(),
            kind,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root_for(&self, workspace_id: &WorkspaceId) -> PathBuf {
        match self.kind {
            LayoutKind::Shared => self.base.clone(),
            LayoutKind::PerWorkspace => self.base.join(workspace_id.as_str()),
        }
    }
}

use serde::{Deserialize, Serialize};

/// Unique identifier for a connection-scoped session.
pub type SessionId = String;

/// Largest text frame the gateway accepts from a client by default.
pub const MAX_CONTROL_FRAME_BYTES: usize = 1024 * 1024;

/// Client-to-server events sent as JSON text frames over the websocket.
///
/// Every request may carry a `request_id`; the reply echoes it so the client
/// can correlate callbacks.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    ListDirectory {
        #[serde(default)]
        request_id: Option<u64>,
        #[serde(default)]
        path: String,
    },
    ReadFile {
        #[serde(default)]
        request_id: Option<u64>,
        path: String,
    },
    WriteFile {
        #[serde(default)]
        request_id: Option<u64>,
        path: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    OpenTerminal {
        #[serde(default)]
        request_id: Option<u64>,
    },
    TerminalInput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ResizeTerminal {
        cols: u16,
        rows: u16,
    },
    CloseTerminal,
}

impl ClientEvent {
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientEvent::ListDirectory { request_id, .. }
            | ClientEvent::ReadFile { request_id, .. }
            | ClientEvent::WriteFile { request_id, .. }
            | ClientEvent::OpenTerminal { request_id } => *request_id,
            ClientEvent::TerminalInput { .. }
            | ClientEvent::ResizeTerminal { .. }
            | ClientEvent::CloseTerminal => None,
        }
    }
}

/// Server-to-client events.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Pushed once after the connection is identified.
    Ready {
        workspace_id: String,
        entries: Vec<TreeEntry>,
    },
    DirectoryListing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        path: String,
        entries: Vec<TreeEntry>,
    },
    FileContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        path: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    FileWritten {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        path: String,
    },
    TerminalOpened {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        pid: u32,
    },
    TerminalOutput {
        pid: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    TerminalExited {
        pid: u32,
        exit_code: Option<u32>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

/// One entry of a directory listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    /// Path relative to the workspace root, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Dir,
    File,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PathDenied,
    NotFound,
    SpawnFailure,
    IoFailure,
    InvalidRequest,
    ServerError,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

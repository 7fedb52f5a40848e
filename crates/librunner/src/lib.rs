pub mod error;
pub mod fs;
pub mod registry;
pub mod store;
pub mod sync;
pub mod terminal;
pub mod workspace;

pub use error::RunnerError;
pub use fs::WorkspaceFs;
pub use registry::{SessionRegistry, SessionSummary};
pub use store::{FsObjectStore, HttpObjectStore, ObjectStore, StoreError};
pub use sync::{RetryPolicy, SyncConfig, SyncSnapshot, SyncWriter};
pub use terminal::{
    OutputSink, TerminalConfig, TerminalEvent, TerminalHandle, TerminalId, TerminalManager,
};
pub use workspace::{LayoutKind, WorkspaceId, WorkspaceLayout};

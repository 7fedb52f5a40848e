pub mod config;
pub mod gateway;

pub use config::{Args, GatewayConfig, StorageBackend, WsTuning};
pub use gateway::{AppState, Gateway};

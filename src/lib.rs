pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod server;
pub mod worker;

pub use api::{init_tracing, ContentReceipt, TaskDescriptor, TaskKind, TaskOutput};
pub use config::EngineConfig;
pub use engine::store::{ContentMetadata, Fingerprint};
pub use engine::RequestOrchestrator;
pub use error::{EngineError, EngineResult};
pub use server::RelayServer;

pub mod health;
pub mod protocol;
pub mod registry;
pub mod traits;

pub use health::{HealthMonitor, ProbeOutcome, ProbeReport};
pub use protocol::{CorrelationId, WorkerMessage};
pub use registry::{Health, WorkerEvent, WorkerId, WorkerRegistry, WorkerStatus};
pub use traits::{LocalChannel, WorkerChannel};

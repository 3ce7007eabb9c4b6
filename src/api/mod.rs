pub mod logging;
pub mod task;

pub use logging::init_tracing;
pub use task::{ContentReceipt, ResolvedContent, TaskDescriptor, TaskKind, TaskOutput};

// Engine: placement, replication, dispatch and the orchestrator that drives them.

pub mod dispatch;
pub mod ledger;
pub mod orchestrator;
pub mod references;
pub mod replication;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use orchestrator::RequestOrchestrator;

pub mod handler;
pub mod socket;

pub use handler::RelayServer;

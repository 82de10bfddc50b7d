//! IPC between the queue client library and the queue daemon.

pub mod protocol;
pub mod server;

pub use protocol::{ClientMessage, DaemonMessage};
pub use server::Server;

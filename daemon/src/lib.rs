//! everarch gateway daemon
//!
//! Accepts WebSocket connections, authenticates clients against the
//! configured user table and bridges their commands to the `evr` tool.

pub mod acceptor;
pub mod auth;
pub mod config;
pub mod connection_registry;
pub mod metrics;
pub mod session;

pub use acceptor::Gateway;
pub use config::DaemonConfig;
pub use session::{Session, SessionContext};

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;
pub mod version;

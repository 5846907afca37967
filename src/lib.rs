pub mod api;
pub mod config;
pub mod keepalive;
pub mod multiplexer;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod runspace;
pub mod scrollback;
pub mod server;
pub mod session;

//! IPC subsystem — s-expression protocol over a Unix domain socket.
//!
//! Frames are a 4-byte big-endian length followed by a UTF-8 s-expression.

pub mod dispatch;
pub mod server;

pub use server::IpcServer;

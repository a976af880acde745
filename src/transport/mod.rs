//! Byte-stream transports carrying the JSON protocol.

pub mod stdio;

pub use stdio::{run_stdio_bridge, serve_connection};

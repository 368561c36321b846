// Streaming bridge: per-client sessions serving still-downloading content as a seekable HTTP resource.

pub mod config;
pub mod engine;
pub mod logging;
pub mod server;
pub mod source;
pub mod subtitle;
pub mod supervisor;

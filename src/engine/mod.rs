// Engine: session lifecycle, acquisition and the chunked download cache.

pub mod acquisition;
pub mod cache;
pub mod downloader;
pub mod progress;
pub mod reaper;
pub mod session;
pub mod store;

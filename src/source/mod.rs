// Content Source abstraction: pluggable backends resolving identifiers into fetchable items.

pub mod http_content;
pub mod http_source;
pub mod memory;
pub mod traits;

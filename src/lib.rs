//! Audio stream proxy for a geo-tagged internet radio directory.
//!
//! Source URLs are classified into one of three delivery strategies (raw
//! ICY/HTTP relay, external media tool bridge, CDN passthrough) and streamed
//! to browser clients as chunked responses. Station ingestion and the station
//! store sit alongside, independent of the proxy.

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod server;
pub mod source;
pub mod store;

// Delivery strategies: the three ways a source URL becomes an audio byte stream.

pub mod cdn_passthrough;
pub mod process_bridge;
pub mod raw_relay;
pub mod resolver;
pub mod traits;

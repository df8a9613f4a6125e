// Request inspection: decides which delivery strategy serves a source URL.

pub mod strategy;

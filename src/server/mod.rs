// HTTP surface: proxy, station listing, counters and static assets.

pub mod handler;

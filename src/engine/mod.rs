// Stream bookkeeping shared by every delivery strategy.

pub mod stats;

//! Stream combinators for frame snapshots

pub mod throttle;

pub use throttle::*;

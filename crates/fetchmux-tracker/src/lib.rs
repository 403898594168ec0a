//! fetchmux-tracker: durable forward-progress checkpoints.
//! One JSON document maps group -> object -> {Updated, LatestTime, Key},
//! replaced atomically on every flush.

pub mod error;
pub mod tracker;

pub use error::TrackerError;
pub use tracker::{ObjectTracker, StateMap, TrackedState};

//! Core engine: the snapshot → decide → execute cycle and the loop that
//! drives it.

pub mod decision;
pub mod executor;
pub mod scheduler;
pub mod snapshot;

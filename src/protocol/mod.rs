//! Topic layout and payload codec shared by both directions of the bridge
//!
//! Pure functions only: nothing in here performs I/O.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

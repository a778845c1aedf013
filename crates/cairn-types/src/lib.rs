//! Shared types for the Cairn checkpoint engine.

mod checkpoint;
mod event;
mod ids;
mod outcome;

pub use checkpoint::*;
pub use event::*;
pub use ids::*;
pub use outcome::*;

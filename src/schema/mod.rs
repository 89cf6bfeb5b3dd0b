//! Schema module - Configuration, tracked-frame and transform types.

mod config;
mod frame;
mod transform;

pub use config::*;
pub use frame::*;
pub use transform::*;

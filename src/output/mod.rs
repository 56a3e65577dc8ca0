// Output module for nexus-dispatch

pub mod errors;
pub mod terminal;

pub use errors::*;
pub use terminal::*;

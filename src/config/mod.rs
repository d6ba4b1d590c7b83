pub mod error;
pub mod loader;
pub mod model;
mod raw;

pub use loader::load_from_path;
pub use model::*;

pub mod events;
pub mod model;

pub use events::*;
pub use model::*;

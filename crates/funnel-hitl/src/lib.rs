pub mod ask;
pub mod controller;

pub use ask::*;
pub use controller::*;

pub mod rule;
pub mod types;

pub use rule::*;
pub use types::*;

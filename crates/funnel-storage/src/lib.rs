pub mod error;
pub mod memory;
pub mod traits;

pub use error::*;
pub use memory::InMemoryStorage;
pub use traits::*;

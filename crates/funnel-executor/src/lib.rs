pub mod agent;
pub mod executor;
pub mod retry;

pub use agent::*;
pub use executor::*;
pub use retry::*;

pub mod config;
pub mod doctor;
pub mod orchestrator;
pub mod runner;
pub mod scenario;
pub mod util;

pub use config::*;
pub use doctor::*;
pub use orchestrator::*;
pub use runner::*;
pub use util::*;

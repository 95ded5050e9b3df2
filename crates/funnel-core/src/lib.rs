pub mod backoff;
pub mod commands;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod outcomes;
pub mod payload;
pub mod router;
pub mod signal;
pub mod snapshot;
pub mod types;

pub use backoff::*;
pub use commands::*;
pub use engine::*;
pub use error::*;
pub use ids::*;
pub use model::*;
pub use outcomes::*;
pub use payload::*;
pub use router::*;
pub use signal::*;
pub use snapshot::*;
pub use types::*;

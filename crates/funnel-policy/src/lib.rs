pub mod pack;
pub mod profile;

pub use pack::*;
pub use profile::*;

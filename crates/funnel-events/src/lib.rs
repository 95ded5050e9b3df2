pub mod event;
pub mod fs_log;
pub mod manifest;
pub mod sink;

pub use event::*;
pub use fs_log::FsEventLog;
pub use manifest::*;
pub use sink::*;

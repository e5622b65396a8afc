pub mod console;
pub mod info;
pub mod render;
pub mod watch;

pub use info::cmd_info;
pub use watch::{cmd_watch, WatchArgs};

pub mod common;
pub mod completions;
pub mod enqueue;
pub mod failed;
pub mod peek;
pub mod progress;
pub mod reset;
pub mod status;
pub mod sync;

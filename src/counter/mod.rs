//! Per-thread and per-process accounting state.
//!
//! A `ProcessCounter` owns one `TaskCounter` per live thread and folds their
//! interval deltas, together with `/proc/<pid>/stat`, into a `ProcessSample`.

pub mod process;
pub mod task;

pub use process::ProcessCounter;
pub use task::TaskCounter;

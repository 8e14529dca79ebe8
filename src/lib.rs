//! procmon - per-service I/O and resource accounting from kernel taskstats
//!
//! The agent finds the processes belonging to each configured name, polls
//! the kernel's taskstats interface for every one of their threads, and
//! periodically ships per-name read/write rates, memory and CPU usage to a
//! collector.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod counter;
pub mod discovery;
pub mod internal_metrics;
pub mod monitor;
pub mod procfs;
pub mod reporting;
pub mod task_manager;
pub mod taskstats;

// Re-export core types for convenience
pub use crate::core::*;

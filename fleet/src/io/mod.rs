//! I/O helpers for fleet commands.

pub mod config;
pub mod fsutil;
pub mod git;
pub mod inventory;
pub mod job_store;
pub mod lock;
pub mod process;
pub mod provider;
pub mod review;
pub mod signals;

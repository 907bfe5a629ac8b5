//! Fleet operations for autonomous coding agents.
//!
//! Two subsystems share this crate: a job orchestrator that launches agents
//! through interchangeable providers, watches them with multi-signal health
//! checks and restarts or finalizes them; and a workspace closure engine that
//! keeps scratch worktrees and canonical clones bounded and recoverable.
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, health
//!   assessment, closure decision tree, budgets, summaries). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes,
//!   providers, review requests, locks).
//!
//! Orchestration modules ([`orchestrator`], [`monitor`], [`sweep`],
//! [`guardian`], [`report`]) combine the two to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod guardian;
pub mod io;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod sweep;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

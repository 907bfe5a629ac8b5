//! Deterministic, pure logic shared by the fleet core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod closure;
pub mod health;
pub mod lifecycle;
pub mod reason;
pub mod summary;
pub mod types;

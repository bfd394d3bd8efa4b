//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod directives;
pub mod narration;
pub mod pacing;
pub mod paths;
pub mod patterns;
pub mod types;

//! Supervisor for an autonomous, tool-using agent.
//!
//! The agent runs in a continuous loop. Everything it does to the world goes
//! through a fixed set of tools, and every iteration is scanned for boundary
//! violations afterwards. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (directives, pacing, patterns, paths).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, subprocesses, the
//!   model API). Seams are traits so tests can script them.
//!
//! [`iteration`] runs a single cycle and [`supervisor`] loops it until a stop
//! condition fires.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! I/O side of the supervisor: filesystem, git, subprocesses, and the model.

pub mod agent_settings;
pub mod config;
pub mod conversation;
pub mod detention;
pub mod disk;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod release;
pub mod scanner;
pub mod tools;

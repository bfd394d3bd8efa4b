//! Per-iteration records on disk.
//!
//! Each finalized iteration is written as `<session>_<ordinal>.json` plus the
//! raw assistant text as `<session>_<ordinal>.response.txt`. The session is
//! the supervisor start time, so a restart never reuses an earlier name, and
//! an existing record is never overwritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::Iteration;

const SESSION_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct IterationLog {
    dir: PathBuf,
    session: String,
}

impl IterationLog {
    pub fn new(dir: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session: session.into(),
        }
    }

    /// A log whose session is named after the current local time.
    pub fn for_new_session(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, chrono::Local::now().format(SESSION_FORMAT).to_string())
    }

    pub fn record_path(&self, ordinal: u64) -> PathBuf {
        self.dir.join(format!("{}_{ordinal:06}.json", self.session))
    }

    pub fn response_path(&self, ordinal: u64) -> PathBuf {
        self.dir.join(format!("{}_{ordinal:06}.response.txt", self.session))
    }

    pub fn write(&self, iteration: &Iteration) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let record = self.record_path(iteration.ordinal);
        let mut json = serde_json::to_string_pretty(iteration).context("serialize iteration")?;
        json.push('\n');
        write_new(&record, json.as_bytes())?;
        write_new(
            &self.response_path(iteration.ordinal),
            iteration.output_text.as_bytes(),
        )?;
        debug!(path = %record.display(), "iteration record written");
        Ok(())
    }

    pub fn read(&self, ordinal: u64) -> Result<Iteration> {
        let path = self.record_path(ordinal);
        let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }
}

fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))
}

use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::core::directory::{DirectorySnapshot, SnapshotMode};

/// Directory snapshots taken with the platform's `zmslapcat` wrapper.
pub struct SlapcatSnapshot {
    program: PathBuf,
    /// Arguments placed before the mode flag, e.g. a script for an interpreter.
    leading_args: Vec<String>,
}

impl SlapcatSnapshot {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl DirectorySnapshot for SlapcatSnapshot {
    async fn snapshot(&self, destination: &Path, mode: SnapshotMode) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        if let Some(flag) = mode.flag() {
            command.arg(flag);
        }
        command.arg(destination);

        debug!(program = %self.program.display(), ?mode, "Running directory snapshot");
        let output = command.output().await?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(io::Error::other(format!(
                "Error running {} ({:?}, {}): {}",
                self.program.display(),
                mode,
                output.status,
                combined.trim()
            ))
            .into());
        }
        Ok(())
    }
}

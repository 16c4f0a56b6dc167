//! Stage command execution.
//!
//! Build and test stages run through the injected [`StageExecutor`]
//! trait; the production [`CommandStageExecutor`] shells out via
//! `tokio::process::Command` with piped output. The per-stage deadline
//! is applied by the run driver, not here.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use shipway_state::CommitId;

use crate::stage::Stage;

/// Output of a build or test stage command.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Combined captured stdout + stderr.
    pub output: String,

    /// Whether the command exited successfully.
    pub success: bool,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// Executes build and test stages against a commit.
///
/// Implementations return `Err` only when the stage could not run at
/// all (spawn failure); a command that runs and exits non-zero is an
/// `Ok` with `success = false`.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, stage: Stage, commit_id: &CommitId) -> anyhow::Result<StageOutput>;
}

/// Production executor: runs the configured shell command for each
/// stage with the commit id exposed as `SHIPWAY_COMMIT`.
pub struct CommandStageExecutor {
    build_command: String,
    test_command: String,
    work_dir: PathBuf,
}

impl CommandStageExecutor {
    pub fn new(build_command: String, test_command: String, work_dir: PathBuf) -> Self {
        Self {
            build_command,
            test_command,
            work_dir,
        }
    }

    fn command_for(&self, stage: Stage) -> anyhow::Result<&str> {
        match stage {
            Stage::Build => Ok(&self.build_command),
            Stage::Test => Ok(&self.test_command),
            Stage::Deploy => anyhow::bail!("deploy stage is not command-driven"),
        }
    }
}

#[async_trait]
impl StageExecutor for CommandStageExecutor {
    async fn execute(&self, stage: Stage, commit_id: &CommitId) -> anyhow::Result<StageOutput> {
        let start = Instant::now();
        let command = self.command_for(stage)?;
        debug!(stage = stage.name(), command, "executing stage command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .env("SHIPWAY_COMMIT", commit_id.as_str())
            .env("SHIPWAY_STAGE", stage.name())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = child.wait_with_output().await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(StageOutput {
            exit_code,
            output: combined,
            success: output.status.success(),
            duration_ms,
        })
    }
}

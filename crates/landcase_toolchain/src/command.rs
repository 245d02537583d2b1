use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use tokio::process::Command;

use crate::ToolchainError;

/// One toolchain invocation: program, arguments, extra environment, and an
/// optional working directory. The extra environment is layered over the
/// inherited process environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run one toolchain command to completion, capturing output.
/// A non-zero exit becomes `CommandFailed` carrying the trimmed stderr; the
/// full text is kept so the reconciler can excerpt the last line later.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput, ToolchainError> {
    let program = spec.program.to_string_lossy().to_string();
    tracing::info!(program = %program, args = ?spec.args, "running toolchain command");
    let started = Instant::now();

    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let output = command
        .output()
        .await
        .map_err(|err| ToolchainError::Io(format!("failed to spawn {program}: {err}")))?;

    tracing::info!(
        program = %program,
        elapsed_ms = started.elapsed().as_millis() as u64,
        exit = output.status.code(),
        "finished toolchain command"
    );

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(ToolchainError::CommandFailed { program, stderr });
    }

    Ok(CommandOutput { stdout, stderr })
}

//! Handlers shipped with the binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use hearth_scheduler::{handler_fn, ExecutionContext, HandlerError, HandlerRegistry, Params, TaskHandler};

/// Longest stderr excerpt carried into an execution error.
const STDERR_EXCERPT: usize = 512;

pub fn builtin() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", handler_fn(|_, _| async { Ok(Params::new()) }));
    handlers.register("command", CommandHandler);
    handlers
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

/// Runs `params.program` with `params.args`. The child is killed if the
/// execution is cancelled.
pub struct CommandHandler;

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn execute(&self, ctx: ExecutionContext, params: Params) -> Result<Params, HandlerError> {
        let cmd: CommandParams = serde_json::from_value(serde_json::Value::Object(params))
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| HandlerError::failed(format!("failed to spawn {}: {e}", cmd.program)))?;
        debug!(task_id = %ctx.task_id, program = %cmd.program, pid = ?child.id(), "command spawned");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(HandlerError::failed(format!(
                "{} exited with {}: {}",
                cmd.program, output.status, excerpt
            )));
        }

        let mut result = Params::new();
        result.insert("exit_code".into(), output.status.code().unwrap_or(0).into());
        result.insert("stdout_bytes".into(), output.stdout.len().into());
        result.insert("stderr_bytes".into(), output.stderr.len().into());
        Ok(result)
    }
}

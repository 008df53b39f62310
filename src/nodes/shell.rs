//! Shell execution backend and the nodes that delegate to it.
//!
//! `ShellTask` runs a single command with arguments; `ShellScript` pipes a
//! multi-line script into an interpreter (`sh -c` by default). Both are
//! capability-driven: the engine consumes a [`ShellBackend`] trait object,
//! and the default [`ProcessShellBackend`] spawns real processes via
//! `tokio::process`. Tests substitute their own backend.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{NodeError, NodeOutcome, NodeRun, WorkflowNode};
use crate::context::NodeExecutionContext;
use crate::definition::{NodeConfig, NodeDefinition};
use crate::types::RuntimeType;

/// Captured result of one shell invocation.
#[derive(Clone, Debug)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Capability interface for process-backed script execution.
#[async_trait]
pub trait ShellBackend: Send + Sync {
    async fn run_command(
        &self,
        command: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, NodeError>;

    async fn run_script(
        &self,
        script: &str,
        shell: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, NodeError>;
}

/// Default backend spawning real processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessShellBackend;

impl ProcessShellBackend {
    /// Children are spawned with `kill_on_drop`, so losing the race to the
    /// cancellation token reaps the process when its future is dropped.
    async fn wait(
        child: tokio::process::Child,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, NodeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(NodeError::cancelled("shell process killed")),
            result = child.wait_with_output() => {
                let output = result.map_err(|e| NodeError::Backend {
                    backend: "shell",
                    message: e.to_string(),
                })?;
                Ok(ShellOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

#[async_trait]
impl ShellBackend for ProcessShellBackend {
    async fn run_command(
        &self,
        command: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, NodeError> {
        let child = Command::new(command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeError::Backend {
                backend: "shell",
                message: format!("failed to spawn `{command}`: {e}"),
            })?;
        Self::wait(child, cancel).await
    }

    async fn run_script(
        &self,
        script: &str,
        shell: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, NodeError> {
        let shell = shell.unwrap_or("sh");
        let mut child = Command::new(shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeError::Backend {
                backend: "shell",
                message: format!("failed to spawn `{shell}`: {e}"),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| NodeError::Backend {
                    backend: "shell",
                    message: format!("failed to write script to `{shell}`: {e}"),
                })?;
        }
        Self::wait(child, cancel).await
    }
}

fn outcome_from(output: ShellOutput, input: NodeExecutionContext) -> Result<NodeOutcome, NodeError> {
    if output.exit_code != 0 {
        return Err(NodeError::Backend {
            backend: "shell",
            message: format!(
                "process exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        });
    }
    let mut context = input;
    context
        .output
        .insert("exitCode".into(), output.exit_code.into());
    context
        .output
        .insert("stdout".into(), output.stdout.trim_end().into());
    context
        .output
        .insert("stderr".into(), output.stderr.trim_end().into());
    Ok(NodeOutcome::with_context(context))
}

/// Single-command node.
pub struct ShellTaskNode {
    node_id: String,
    command: String,
    args: Vec<String>,
}

impl ShellTaskNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::ShellTask { command, args } => Ok(Self {
                node_id: def.node_id.clone(),
                command: command.clone(),
                args: args.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!(
                    "expected ShellTask configuration, got {}",
                    other.runtime_type()
                ),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for ShellTaskNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::ShellTask
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let output = run
            .services
            .shell
            .run_command(&self.command, &self.args, &cancel)
            .await?;
        outcome_from(output, input)
    }
}

/// Multi-line script node.
pub struct ShellScriptNode {
    node_id: String,
    script: String,
    shell: Option<String>,
}

impl ShellScriptNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::ShellScript { script, shell } => Ok(Self {
                node_id: def.node_id.clone(),
                script: script.clone(),
                shell: shell.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!(
                    "expected ShellScript configuration, got {}",
                    other.runtime_type()
                ),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for ShellScriptNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::ShellScript
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let output = run
            .services
            .shell
            .run_script(&self.script, self.shell.as_deref(), &cancel)
            .await?;
        outcome_from(output, input)
    }
}

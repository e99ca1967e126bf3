//! Generic subprocess runtime adapter.
//!
//! Wraps an agent CLI configured in `[backends.<tag>]`: the prompt is
//! written to the child's stdin, stdout lines stream back as text
//! messages, and a non-zero exit surfaces as an error message carrying
//! stderr. The system prompt and model are exported through environment
//! variables so any agent CLI can pick them up.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use arkaledge_core::runtime::{AgentMessage, AgentRuntime, MessageStream, RunOptions};

use crate::config::BackendCommand;

/// Environment variables exported to the agent process.
const ENV_SYSTEM_PROMPT: &str = "ARKALEDGE_SYSTEM_PROMPT";
const ENV_MODEL: &str = "ARKALEDGE_MODEL";
const ENV_TOOLS: &str = "ARKALEDGE_TOOLS";

/// An agent backend launched as a subprocess per run.
pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
    model: String,
    /// The in-flight child, if any, so `abort` can kill it.
    child: Arc<Mutex<Option<Child>>>,
}

impl ProcessRuntime {
    pub fn new(backend: &BackendCommand, model: impl Into<String>) -> Self {
        Self {
            command: backend.command.clone(),
            args: backend.args.clone(),
            model: model.into(),
            child: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn run(&self, prompt: &str, options: &RunOptions) -> Result<MessageStream> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env(ENV_MODEL, &self.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(system_prompt) = &options.system_prompt {
            cmd.env(ENV_SYSTEM_PROMPT, system_prompt);
        }
        if let Some(tools) = &options.allowed_tools {
            cmd.env(ENV_TOOLS, tools.join(","));
        }
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent process {:?}", self.command))?;

        // Feed the prompt and close stdin so the agent starts.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("agent stdout not captured")?;
        let stderr = child.stderr.take().context("agent stderr not captured")?;

        // Drain stderr concurrently so a full pipe never stalls the agent.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        *self.child.lock().await = Some(child);
        let child_slot = Arc::clone(&self.child);

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                yield AgentMessage::text(line);
            }

            let stderr_output = stderr_task.await.unwrap_or_default();
            let status = match child_slot.lock().await.take() {
                Some(mut child) => child.wait().await.ok(),
                None => None, // aborted
            };

            match status {
                Some(status) if status.success() => {}
                Some(status) => {
                    let code = status.code().unwrap_or(-1);
                    yield AgentMessage::error(format!(
                        "agent process exited with code {code}: {}",
                        stderr_output.trim()
                    ));
                }
                None => {
                    yield AgentMessage::error("agent process was aborted".to_string());
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn resume(
        &self,
        _session_id: &str,
        prompt: &str,
        options: &RunOptions,
    ) -> Result<MessageStream> {
        // Plain subprocess backends have no session support; run fresh.
        self.run(prompt, options).await
    }

    async fn abort(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "failed to kill agent process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn backend(script: &str) -> BackendCommand {
        BackendCommand {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn streams_stdout_lines_as_text() {
        let runtime = ProcessRuntime::new(&backend("cat >/dev/null; echo one; echo two"), "m");
        let stream = runtime.run("ignored", &RunOptions::default()).await.unwrap();
        let messages: Vec<AgentMessage> = stream.collect().await;

        let texts: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn prompt_reaches_stdin() {
        let runtime = ProcessRuntime::new(&backend("cat"), "m");
        let stream = runtime.run("echoed back", &RunOptions::default()).await.unwrap();
        let messages: Vec<AgentMessage> = stream.collect().await;
        assert_eq!(messages[0].content, "echoed back");
    }

    #[tokio::test]
    async fn nonzero_exit_yields_error_message() {
        let runtime =
            ProcessRuntime::new(&backend("cat >/dev/null; echo oops >&2; exit 3"), "m");
        let stream = runtime.run("x", &RunOptions::default()).await.unwrap();
        let messages: Vec<AgentMessage> = stream.collect().await;

        let last = messages.last().unwrap();
        assert!(last.content.contains("exited with code 3"));
        assert!(last.content.contains("oops"));
    }

    #[tokio::test]
    async fn system_prompt_exported_via_env() {
        let runtime = ProcessRuntime::new(
            &backend("cat >/dev/null; printenv ARKALEDGE_SYSTEM_PROMPT"),
            "m",
        );
        let options = RunOptions {
            system_prompt: Some("be kind".into()),
            ..Default::default()
        };
        let stream = runtime.run("x", &options).await.unwrap();
        let messages: Vec<AgentMessage> = stream.collect().await;
        assert_eq!(messages[0].content, "be kind");
    }
}

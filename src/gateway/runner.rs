//! 沙箱进程执行
//!
//! 直接 exec 参数数组，不经过 `sh -c`，因此不存在 shell 拼接；
//! 墙钟超时与输出上限总是生效，超限时子进程随 kill_on_drop 被终止。

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// 进程输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Output exceeded {limit} bytes")]
    OutputLimit { limit: usize },

    #[error("Failed to spawn: {0}")]
    Spawn(String),

    #[error("Empty command")]
    EmptyCommand,
}

/// 进程执行能力
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, RunError>;
}

/// 基于 tokio::process 的默认实现
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    max_output_bytes: usize,
}

impl TokioProcessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, RunError> {
        let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;
        tracing::debug!(program = %program, cwd = %cwd.display(), "spawning process");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn(e.to_string()))?;

        let limit = self.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let work = async {
            let (out, err) =
                tokio::try_join!(read_limited(stdout, limit), read_limited(stderr, limit))?;
            let status = child
                .wait()
                .await
                .map_err(|e| RunError::Spawn(e.to_string()))?;
            Ok::<_, RunError>(ProcessOutput {
                stdout: String::from_utf8_lossy(&out).to_string(),
                stderr: String::from_utf8_lossy(&err).to_string(),
                exit_code: status.code(),
            })
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout(timeout)),
        }
    }
}

async fn read_limited<R>(reader: Option<R>, limit: usize) -> Result<Vec<u8>, RunError>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| RunError::Spawn(e.to_string()))?;
    if buf.len() > limit {
        return Err(RunError::OutputLimit { limit });
    }
    Ok(buf)
}

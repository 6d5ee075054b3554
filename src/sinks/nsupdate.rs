//! Signed dynamic updates through the `nsupdate` tool.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::dns::Updater;
use crate::error::{Error, Result};

pub struct NsUpdate {
    program: PathBuf,
    timeout: Duration,
}

impl NsUpdate {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

/// The input fed to `nsupdate`: the target server, the statements in
/// order, then `send` and `quit`.
pub fn script(server: &str, statements: &[String]) -> String {
    let mut script = format!("server {}\n", server);
    for statement in statements {
        script.push_str(statement);
        script.push('\n');
    }
    script.push_str("send\nquit\n");
    script
}

#[async_trait]
impl Updater for NsUpdate {
    /// Any output on stderr counts as failure, even with a zero exit code.
    async fn apply(&self, server: &str, key: &str, statements: &[String]) -> Result<()> {
        let script = script(server, statements);
        debug!("nsupdate script for [{}]:\n{}", server, script);

        let mut child = Command::new(&self.program)
            .arg("-y")
            .arg(key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Update("nsupdate stdin unavailable".into()))?;
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin);

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(Error::Update(if stderr.is_empty() {
                format!("nsupdate exited with {}", output.status)
            } else {
                stderr
            }));
        }
        if !stderr.is_empty() {
            return Err(Error::Update(stderr));
        }
        Ok(())
    }
}

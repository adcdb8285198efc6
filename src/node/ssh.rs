use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, Stdio};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{
    append_vmta_block_text, extract_sender_for_vmta, insert_pattern_list_entry, list_vmta_names,
    remove_vmta_block_text, render_pattern_list_entry, render_vmta_block, set_vmta_rate_text,
    NodeClient, NodeConfig, NodeError, VmtaRates,
};

/// Executes the node's shell operations over a secure SSH channel. All
/// mutations are done by reading the authoritative config file back to this
/// process, transforming it in memory with the pure functions in
/// [`super`], and pushing the result back via a temp file — never by
/// interpolating externally sourced strings into a remote shell command.
pub struct SshNodeClient {
    config: NodeConfig,
    connect_timeout: Duration,
    call_timeout: Duration,
    graceful_reload_queue_depth_threshold: i64,
}

impl SshNodeClient {
    pub fn new(
        config: NodeConfig,
        connect_timeout: Duration,
        call_timeout: Duration,
        graceful_reload_queue_depth_threshold: i64,
    ) -> Self {
        Self {
            config,
            connect_timeout,
            call_timeout,
            graceful_reload_queue_depth_threshold,
        }
    }

    /// Bounds every suspension point spent waiting on a remote command
    /// (spec's connect/call timeout budget) rather than letting an
    /// unreachable node hang the calling job indefinitely.
    async fn with_call_timeout<F, T, E>(&self, fut: F) -> Result<T, NodeError>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NodeError::Unreachable(e.to_string())),
            Err(_) => Err(NodeError::Unreachable(format!(
                "remote command timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    async fn connect(&self) -> Result<Session, NodeError> {
        match tokio::time::timeout(
            self.connect_timeout,
            Session::connect(
                format!("{}@{}", self.config.ssh_user, self.config.host),
                KnownHosts::Add,
            ),
        )
        .await
        {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(NodeError::Unreachable(e.to_string())),
            Err(_) => Err(NodeError::Unreachable(format!(
                "connect to {} timed out after {:?}",
                self.config.host, self.connect_timeout
            ))),
        }
    }

    async fn read_config(&self, session: &Session) -> Result<String, NodeError> {
        let output = self
            .with_call_timeout(session.command("cat").arg(&self.config.config_path).output())
            .await?;
        check_status(&output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Writes `contents` to a remote temp file, then atomically moves it
    /// over the authoritative config path. Never passes `contents` on the
    /// command line.
    async fn write_config(&self, session: &Session, contents: &str) -> Result<(), NodeError> {
        let tmp_path = format!("{}.tmp-{}", self.config.config_path, uuid::Uuid::new_v4());

        let op = async {
            let mut child = session
                .command("tee")
                .arg(&tmp_path)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .spawn()
                .await
                .map_err(|e| NodeError::Unreachable(e.to_string()))?;

            child
                .stdin()
                .as_mut()
                .expect("piped stdin")
                .write_all(contents.as_bytes())
                .await?;
            child
                .stdin()
                .as_mut()
                .expect("piped stdin")
                .shutdown()
                .await?;

            let status = child
                .wait()
                .await
                .map_err(|e| NodeError::Unreachable(e.to_string()))?;
            if !status.success() {
                return Err(NodeError::CommandFailed {
                    status: status.code().unwrap_or(-1),
                    stderr: "tee failed".to_string(),
                });
            }

            session
                .command("mv")
                .arg(&tmp_path)
                .arg(&self.config.config_path)
                .output()
                .await
                .map_err(|e| NodeError::Unreachable(e.to_string()))
        };

        match tokio::time::timeout(self.call_timeout, op).await {
            Ok(Ok(mv)) => check_status(&mv),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NodeError::Unreachable(format!(
                "remote config write timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

fn check_status(output: &openssh::process::Output) -> Result<(), NodeError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(NodeError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl NodeClient for SshNodeClient {
    async fn reachable(&self) -> bool {
        match self.connect().await {
            Ok(session) => self
                .with_call_timeout(session.command("true").status())
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    async fn running(&self) -> Result<bool, NodeError> {
        let session = self.connect().await?;
        let output = self
            .with_call_timeout(session.command("systemctl").args(["is-active", "pmta"]).output())
            .await?;
        Ok(output.status.success())
    }

    async fn queue_depth(&self) -> Result<i64, NodeError> {
        let session = self.connect().await?;
        let output = match self
            .with_call_timeout(session.command("pmta").args(["show", "queues", "--csv"]).output())
            .await
        {
            Ok(output) => output,
            Err(_) => {
                warn!(node_id = %self.config.node_id, "queue depth indeterminate");
                return Ok(-1);
            }
        };
        if !output.status.success() {
            warn!(node_id = %self.config.node_id, "queue depth indeterminate");
            return Ok(-1);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let total: i64 = text
            .lines()
            .skip(1)
            .filter_map(|line| line.split(',').nth(1)?.trim().parse::<i64>().ok())
            .sum();
        Ok(total)
    }

    async fn append_vmta_block(
        &self,
        name: &str,
        ip: IpAddr,
        hostname: &str,
        sender_email: &str,
        dkim_key_path: &str,
    ) -> Result<(), NodeError> {
        let session = self.connect().await?;
        let config = self.read_config(&session).await?;

        let block = render_vmta_block(name, ip, hostname, dkim_key_path, VmtaRates::default());
        let with_block = append_vmta_block_text(&config, &block);

        let entry = render_pattern_list_entry(sender_email, name);
        match insert_pattern_list_entry(&with_block, &entry) {
            Ok(final_config) => {
                self.write_config(&session, &final_config).await?;
                self.graceful_reload().await?;
                Ok(())
            }
            Err(e) => {
                // Leave the node untouched: we never wrote the in-memory
                // intermediate back, so nothing needs to be rolled back.
                warn!(node_id = %self.config.node_id, name, "pattern-list insert failed, vmta block not written: {e}");
                Err(e)
            }
        }
    }

    async fn remove_vmta_block(&self, name: &str, sender_email: &str) -> Result<(), NodeError> {
        let session = self.connect().await?;
        let config = self.read_config(&session).await?;
        let _ = sender_email;
        let updated = remove_vmta_block_text(&config, name);
        self.write_config(&session, &updated).await?;
        self.graceful_reload().await
    }

    async fn set_vmta_rate(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError> {
        let session = self.connect().await?;
        let config = self.read_config(&session).await?;
        let updated = set_vmta_rate_text(&config, name, msgs_per_hour)?;
        self.write_config(&session, &updated).await?;
        self.graceful_reload().await
    }

    async fn pause_vmta(&self, name: &str) -> Result<(), NodeError> {
        self.set_vmta_rate(name, 0).await
    }

    async fn resume_vmta(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError> {
        self.set_vmta_rate(name, msgs_per_hour).await
    }

    async fn list_vmtas(&self) -> Result<Vec<String>, NodeError> {
        let session = self.connect().await?;
        let config = self.read_config(&session).await?;
        Ok(list_vmta_names(&config))
    }

    async fn get_sender_for_vmta(&self, name: &str) -> Result<Option<String>, NodeError> {
        let session = self.connect().await?;
        let config = self.read_config(&session).await?;
        Ok(extract_sender_for_vmta(&config, name))
    }

    async fn graceful_reload(&self) -> Result<(), NodeError> {
        let session = self.connect().await?;
        let queue = self.queue_depth().await.unwrap_or(-1);
        if queue > self.graceful_reload_queue_depth_threshold {
            info!(
                node_id = %self.config.node_id,
                queue,
                threshold = self.graceful_reload_queue_depth_threshold,
                "deferring graceful reload, queue too deep"
            );
            return Ok(());
        }
        let output = self
            .with_call_timeout(session.command("pmta").args(["reload"]).output())
            .await?;
        check_status(&output)?;
        Ok(())
    }
}

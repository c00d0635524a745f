//! SSH 远程会话
//!
//! 单主机的认证命令执行通道，所有远程操作（命令、文件放置）都经由它。
//! 非零退出码不算执行层错误，由调用方按各自命令语义判断；
//! 每条命令都受单条命令超时约束。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::constants::{COMMAND_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS};
use crate::domain::deploy::{AuthMethod, DeploymentTarget, LogLine};
use crate::error::{DeployError, DeployResult};
use crate::infra::shell;

/// 远程命令执行结果
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// 远端退出码；通道未上报时为 None
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(self.exit_code, Some(0) | None)
    }
}

/// 远程会话接口
///
/// 管线与远端交互的唯一边界，测试用脚本化实现替换
#[async_trait]
pub trait RemoteSession: Send {
    /// 执行命令并收集输出；仅在远程进程无法启动时返回错误
    async fn execute(&mut self, command: &str) -> DeployResult<CommandOutput>;

    /// 流式执行：每个输出块推入广播通道，块间检查取消
    ///
    /// 被取消时立即返回 Ok(None)，不视为错误
    async fn execute_streaming(
        &mut self,
        command: &str,
        tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> DeployResult<Option<u32>>;

    /// 将字节内容写入远端文件
    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> DeployResult<()>;

    /// 幂等创建远端目录；“已存在”不是错误
    async fn ensure_dir(&mut self, remote_path: &str) -> DeployResult<()> {
        let output = self.execute(&shell::mkdir_command(remote_path)).await?;
        if !output.success() && !output.stderr.contains("File exists") {
            return Err(DeployError::Transfer(format!(
                "failed to create remote directory {}: {}",
                remote_path,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// 关闭会话通道
    async fn close(&mut self) -> DeployResult<()>;
}

/// 会话工厂
///
/// 协调器通过工厂获取会话，保证每次 run 独占一条会话
/// 并在所有退出路径上释放它
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, target: &DeploymentTarget) -> DeployResult<Box<dyn RemoteSession>>;
}

/// russh 客户端 handler
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // 对标 AutoAddPolicy：接受目标主机的 host key
        Ok(true)
    }
}

/// 基于 russh 的远程会话实现
pub struct SshSession {
    handle: client::Handle<ClientHandler>,
}

impl SshSession {
    /// 建立连接并认证；连接受固定超时约束，失败不重试
    pub async fn connect(target: &DeploymentTarget) -> DeployResult<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let addr = (target.address, 22u16);
        let connect_future = client::connect(config, addr, ClientHandler);
        let mut handle =
            tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_future)
                .await
                .map_err(|_| {
                    DeployError::Connection(format!(
                        "timed out connecting to {} after {}s",
                        target.address, CONNECT_TIMEOUT_SECS
                    ))
                })?
                .map_err(|e| DeployError::Connection(e.to_string()))?;

        let authenticated = match &target.auth {
            AuthMethod::KeyFile(path) => {
                let key = russh_keys::load_secret_key(path, None)
                    .map_err(|e| DeployError::Authentication(format!("bad key file: {}", e)))?;
                handle
                    .authenticate_publickey(&target.user, Arc::new(key))
                    .await
                    .map_err(|e| DeployError::Authentication(e.to_string()))?
            }
            AuthMethod::Password(password) => handle
                .authenticate_password(&target.user, password)
                .await
                .map_err(|e| DeployError::Authentication(e.to_string()))?,
            AuthMethod::None => handle
                .authenticate_none(&target.user)
                .await
                .map_err(|e| DeployError::Authentication(e.to_string()))?,
        };

        if !authenticated {
            return Err(DeployError::Authentication(format!(
                "credentials rejected for {}@{}",
                target.user, target.address
            )));
        }

        info!(host = %target.address, user = %target.user, "SSH session established");
        Ok(Self { handle })
    }

    async fn run_channel(&mut self, command: &str) -> Result<CommandOutput, DeployError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DeployError::RemoteCommand(e.to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| DeployError::RemoteCommand(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&mut self, command: &str) -> DeployResult<CommandOutput> {
        debug!(command = %command, "Executing remote command");
        let result = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            self.run_channel(command),
        )
        .await
        .map_err(|_| DeployError::RemoteCommandTimeout(COMMAND_TIMEOUT_SECS))??;

        if let Some(code) = result.exit_code {
            if code != 0 {
                debug!(command = %command, exit_code = code, "Remote command returned non-zero");
            }
        }
        Ok(result)
    }

    async fn execute_streaming(
        &mut self,
        command: &str,
        tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> DeployResult<Option<u32>> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DeployError::RemoteCommand(e.to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| DeployError::RemoteCommand(e.to_string()))?;

        let mut exit_code = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(command = %command, "Log stream cancelled by consumer");
                    return Ok(None);
                }
                msg = channel.wait() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ChannelMsg::Data { ref data } => {
                            let _ = tx.send(LogLine::stdout(String::from_utf8_lossy(data).into_owned()));
                        }
                        ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                            let _ = tx.send(LogLine::stderr(String::from_utf8_lossy(data).into_owned()));
                        }
                        ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                        _ => {}
                    }
                }
            }
        }
        Ok(exit_code)
    }

    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> DeployResult<()> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DeployError::Transfer(e.to_string()))?;

        channel
            .exec(true, shell::write_file_command(remote_path))
            .await
            .map_err(|e| DeployError::Transfer(e.to_string()))?;

        channel
            .data(contents)
            .await
            .map_err(|e| DeployError::Transfer(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| DeployError::Transfer(e.to_string()))?;

        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status } = msg {
                exit_code = Some(exit_status);
            }
        }

        match exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(DeployError::Transfer(format!(
                "remote write to {} exited with {}",
                remote_path, code
            ))),
        }
    }

    async fn close(&mut self) -> DeployResult<()> {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(error = %e, "SSH disconnect returned an error");
        }
        Ok(())
    }
}

/// 默认的 SSH 会话工厂
pub struct SshSessionFactory;

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(&self, target: &DeploymentTarget) -> DeployResult<Box<dyn RemoteSession>> {
        let session = SshSession::connect(target).await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        };
        assert!(ok.success());

        let no_status = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        };
        assert!(no_status.success());

        let failed = CommandOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: Some(1),
        };
        assert!(!failed.success());
    }
}

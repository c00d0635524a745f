//! 统一错误类型
//!
//! 部署管线的全部错误形态，按阶段归类；除 DNS 逐条记录的失败外，
//! 任何错误都会原样上抛并终止所在阶段

use thiserror::Error;

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 无法建立 SSH 连接（不可达 / 超时）
    #[error("connection failed: {0}")]
    Connection(String),

    /// SSH 认证失败
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// 远程命令无法启动或通道异常
    #[error("remote command failed: {0}")]
    RemoteCommand(String),

    /// 远程命令超过单条命令超时
    #[error("remote command timed out after {0} seconds")]
    RemoteCommandTimeout(u64),

    /// 域名在提供商处没有对应 zone
    #[error("no DNS zone found for domain {0}")]
    ZoneNotFound(String),

    /// DNS 提供商返回非成功响应
    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    /// 文件传输失败（仅针对本地存在的路径）
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// 服务描述违反不变量，无法生成 manifest
    #[error("manifest render failed: {0}")]
    ManifestRender(String),

    /// 容器编排启动 / 验证失败
    #[error("orchestration failed: {0}")]
    Orchestration(String),

    /// 协作式取消
    #[error("run was cancelled")]
    Cancelled,

    /// 查询了不存在的 run
    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// 便捷类型别名
pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    /// 错误类别标识，用于日志与进度事件
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Connection(_) => "connection",
            DeployError::Authentication(_) => "authentication",
            DeployError::RemoteCommand(_) => "remote_command",
            DeployError::RemoteCommandTimeout(_) => "remote_command_timeout",
            DeployError::ZoneNotFound(_) => "zone_not_found",
            DeployError::DnsProvider(_) => "dns_provider",
            DeployError::Transfer(_) => "transfer",
            DeployError::ManifestRender(_) => "manifest_render",
            DeployError::Orchestration(_) => "orchestration",
            DeployError::Cancelled => "cancelled",
            DeployError::RunNotFound(_) => "run_not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::ZoneNotFound("example.com".to_string());
        assert_eq!(err.to_string(), "no DNS zone found for domain example.com");

        let err = DeployError::RemoteCommandTimeout(600);
        assert_eq!(
            err.to_string(),
            "remote command timed out after 600 seconds"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(DeployError::Cancelled.kind(), "cancelled");
        assert_eq!(
            DeployError::Connection("refused".to_string()).kind(),
            "connection"
        );
    }
}

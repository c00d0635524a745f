//! 部署相关领域模型

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};

/// SSH 认证方式
///
/// 凭据在管线启动前解析完毕，管线内部不做任何交互式输入
#[derive(Clone, Debug)]
pub enum AuthMethod {
    /// 私钥文件
    KeyFile(PathBuf),
    /// 密码
    Password(String),
    /// none 认证（目标主机不要求凭据时）
    None,
}

/// 部署目标
///
/// 标识一次部署要落到哪台主机；整个 run 生命周期内不可变
#[derive(Clone, Debug)]
pub struct DeploymentTarget {
    /// 主域名（如 example.com）
    pub domain: String,
    /// 目标主机地址
    pub address: IpAddr,
    /// 远程用户
    pub user: String,
    /// 认证方式
    pub auth: AuthMethod,
}

impl DeploymentTarget {
    pub fn new(domain: impl Into<String>, address: IpAddr, auth: AuthMethod) -> Self {
        Self {
            domain: domain.into(),
            address,
            user: "root".to_string(),
            auth,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// 服务构建来源
///
/// 每个服务恰好二选一：本地构建上下文 或 预构建镜像
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceSource {
    /// 本地构建上下文路径（随部署上传到远端）
    Build(PathBuf),
    /// 镜像引用（如 redis:7）
    Image(String),
}

/// 单个容器工作负载的描述
#[derive(Clone, Debug)]
pub struct ServiceDescriptor {
    /// 逻辑名称（栈内唯一）
    pub name: String,
    /// 对外子域名（internal 服务为 None）
    pub subdomain: Option<String>,
    /// 监听端口
    pub port: u16,
    /// 构建来源
    pub source: ServiceSource,
    /// 内部 / 有状态服务：获得命名卷，不暴露路由
    pub internal: bool,
}

impl ServiceDescriptor {
    pub fn from_build(name: impl Into<String>, path: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            name: name.into(),
            subdomain: None,
            port,
            source: ServiceSource::Build(path.into()),
            internal: false,
        }
    }

    pub fn from_image(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            subdomain: None,
            port,
            source: ServiceSource::Image(image.into()),
            internal: false,
        }
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// 校验描述符不变量
    ///
    /// 名称与子域名会进入远程命令和渲染产物，字符集必须受限
    pub fn validate(&self) -> DeployResult<()> {
        if self.name.is_empty() {
            return Err(DeployError::ManifestRender(
                "service name must not be empty".to_string(),
            ));
        }
        if !self
            .name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_'))
        {
            return Err(DeployError::ManifestRender(format!(
                "service name {:?} contains characters outside [a-z0-9_-]",
                self.name
            )));
        }
        if let Some(sub) = &self.subdomain {
            if sub.is_empty()
                || !sub
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            {
                return Err(DeployError::ManifestRender(format!(
                    "subdomain {:?} of service {} contains characters outside [a-z0-9-]",
                    sub, self.name
                )));
            }
        }
        if let ServiceSource::Image(image) = &self.source {
            if image.is_empty() {
                return Err(DeployError::ManifestRender(format!(
                    "service {} has an empty image reference",
                    self.name
                )));
            }
        }
        if self.internal && self.subdomain.is_some() {
            return Err(DeployError::ManifestRender(format!(
                "internal service {} must not expose a subdomain",
                self.name
            )));
        }
        Ok(())
    }
}

/// 期望的服务栈拓扑，按唯一名称索引
///
/// BTreeMap 保证所有派生产物（manifest、路由配置）的迭代顺序确定
pub type ServiceSet = BTreeMap<String, ServiceDescriptor>;

/// 由描述符列表构建服务集合，名称重复时报错
pub fn build_service_set(services: Vec<ServiceDescriptor>) -> DeployResult<ServiceSet> {
    let mut set = ServiceSet::new();
    for svc in services {
        svc.validate()?;
        let name = svc.name.clone();
        if set.insert(name.clone(), svc).is_some() {
            return Err(DeployError::ManifestRender(format!(
                "duplicate service name: {}",
                name
            )));
        }
    }
    Ok(set)
}

/// 部署运行状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终态；终态不再转移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// 部署阶段，顺序固定且全序
///
/// 后一阶段只有在前面所有阶段成功后才会执行
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Connect,
    DnsReconcile,
    HostPrepare,
    Transfer,
    Orchestrate,
    Verify,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Connect => "connect",
            RunPhase::DnsReconcile => "dns_reconcile",
            RunPhase::HostPrepare => "host_prepare",
            RunPhase::Transfer => "transfer",
            RunPhase::Orchestrate => "orchestrate",
            RunPhase::Verify => "verify",
        }
    }

    /// 固定的阶段顺序
    pub const ORDER: [RunPhase; 6] = [
        RunPhase::Connect,
        RunPhase::DnsReconcile,
        RunPhase::HostPrepare,
        RunPhase::Transfer,
        RunPhase::Orchestrate,
        RunPhase::Verify,
    ];
}

/// 一次部署管线的执行记录
///
/// 只由协调器修改；外部通过 RunStore 查询快照
#[derive(Clone, Debug)]
pub struct DeploymentRun {
    pub id: String,
    pub status: RunStatus,
    /// 当前（或失败时所在）阶段
    pub phase: Option<RunPhase>,
    pub target: DeploymentTarget,
    pub services: ServiceSet,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 终止错误，失败时原样记录触发阶段的错误文本
    pub error: Option<String>,
}

impl DeploymentRun {
    pub fn new(target: DeploymentTarget, services: ServiceSet) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Queued,
            phase: None,
            target,
            services,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

/// 进度事件
///
/// 每次阶段转移和每个重要子步骤（如每条 DNS 记录调和完成）各发一条；
/// 投递是尽力而为的扇出，掉线的订阅者不会阻塞 run
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub run_id: String,
    /// 阶段名或状态名（如 "dns_reconcile"、"failed"）
    pub phase_or_status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        run_id: impl Into<String>,
        phase_or_status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            phase_or_status: phase_or_status.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

/// 部署验证报告
///
/// 证书判定基于反向代理日志文本的启发式扫描，只能作为参考信号，
/// 不成功时给出警告而非失败
#[derive(Clone, Debug, Serialize)]
pub struct VerificationReport {
    /// 栈状态文本（compose ps 输出）
    pub status_text: String,
    /// 日志中是否出现证书获取 / serving 信号
    pub certificates_ready: bool,
    /// 未就绪时的警告说明
    pub warning: Option<String>,
}

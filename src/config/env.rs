//! 环境变量配置加载

use std::env;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// Cloudflare API token
    pub cloudflare_api_token: Option<String>,
    /// Cloudflare 账号邮箱（可选，token 足够时不需要）
    pub cloudflare_email: Option<String>,
    /// DNS 记录 TTL（秒）
    pub cloudflare_ttl: u32,
    /// 是否启用 Cloudflare 代理
    pub cloudflare_proxy_enabled: bool,
    /// ACME 证书邮箱（缺省时由域名派生 admin@{domain}）
    pub ssl_email: Option<String>,
    /// 远程登录用户
    pub remote_user: String,
    /// 项目名，决定远端部署根目录 /opt/{project}
    pub project_name: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let cloudflare_ttl = env::var("CLOUDFLARE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        let cloudflare_proxy_enabled = env::var("CLOUDFLARE_PROXY_ENABLED")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Self {
            cloudflare_api_token: env::var("CLOUDFLARE_API_TOKEN").ok(),
            cloudflare_email: env::var("CLOUDFLARE_EMAIL").ok(),
            cloudflare_ttl,
            cloudflare_proxy_enabled,
            ssl_email: env::var("SSL_EMAIL").ok(),
            remote_user: env::var("DEPLOY_REMOTE_USER").unwrap_or_else(|_| "root".to_string()),
            project_name: env::var("DEPLOY_PROJECT_NAME")
                .unwrap_or_else(|_| "deploymat-app".to_string()),
        }
    }

    /// 远端项目根目录
    pub fn remote_root(&self) -> String {
        format!("/opt/{}", self.project_name)
    }

    /// 证书邮箱，缺省由域名派生
    pub fn ssl_email_or_default(&self, domain: &str) -> String {
        self.ssl_email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", domain))
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cloudflare_api_token: None,
            cloudflare_email: None,
            cloudflare_ttl: 300,
            cloudflare_proxy_enabled: true,
            ssl_email: None,
            remote_user: "root".to_string(),
            project_name: "deploymat-app".to_string(),
        }
    }
}

pub mod constants {
    /// SSH 连接超时（秒），连接失败不重试
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// 单条远程命令超时（秒）
    pub const COMMAND_TIMEOUT_SECS: u64 = 600;

    /// DNS 调和后的传播等待（秒）
    pub const DNS_PROPAGATION_DELAY_SECS: u64 = 5;

    /// 容器启动后的稳定等待（秒）
    pub const CONTAINER_SETTLE_SECS: u64 = 10;

    /// 进度事件广播通道容量
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// 保留的 run 记录上限，超出后从最旧的终态 run 开始修剪
    pub const MAX_RUN_HISTORY: usize = 100;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

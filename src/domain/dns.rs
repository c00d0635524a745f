//! DNS 相关领域模型
//!
//! 记录与 zone 均由提供商持有，这里只保存短暂的读写视图

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// 记录类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordKind {
    A,
    AAAA,
    CNAME,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::A => "A",
            RecordKind::AAAA => "AAAA",
            RecordKind::CNAME => "CNAME",
        }
    }

    /// 目标地址对应的记录类型
    pub fn for_address(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => RecordKind::A,
            IpAddr::V6(_) => RecordKind::AAAA,
        }
    }
}

/// 提供商侧的单条 DNS 记录
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    /// 提供商标识，创建 / 拉取后才有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 完整记录名（FQDN）
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// 记录内容（地址）
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
}

impl DnsRecord {
    /// 构造一条期望状态的记录（尚无提供商标识）
    pub fn desired(name: impl Into<String>, kind: RecordKind, content: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            content: content.into(),
            ttl: 300,
            proxied: true,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }
}

/// 提供商的 zone（域名管理单元）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DnsZone {
    pub id: String,
    pub name: String,
}

/// 部署需要的固定子域集合
const DESIRED_SUBDOMAINS: [&str; 4] = ["www", "app", "site", "api"];

/// 期望的记录名集合：{D, www.D, app.D, site.D, api.D}
///
/// 由域名派生而非配置
pub fn desired_names(domain: &str) -> Vec<String> {
    let mut names = vec![domain.to_string()];
    names.extend(
        DESIRED_SUBDOMAINS
            .iter()
            .map(|sub| format!("{}.{}", sub, domain)),
    );
    names
}

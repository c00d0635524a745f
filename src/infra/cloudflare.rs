//! Cloudflare DNS API Client
//!
//! 封装 zone 查询与记录的增删改查，复用连接池；
//! 任何非成功响应都折叠为带消息串联的 DnsProvider 错误

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::dns::{DnsRecord, DnsZone, RecordKind};
use crate::error::{DeployError, DeployResult};

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// DNS 提供商接口
///
/// 调和器只依赖这个边界，测试用内存实现替换
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// 按域名精确查找 zone
    async fn find_zone(&self, domain: &str) -> DeployResult<Option<DnsZone>>;

    /// 列出 zone 内指定类型（可选指定名称）的记录
    async fn list_records(
        &self,
        zone_id: &str,
        kind: RecordKind,
        name: Option<&str>,
    ) -> DeployResult<Vec<DnsRecord>>;

    async fn create_record(&self, zone_id: &str, record: &DnsRecord) -> DeployResult<DnsRecord>;

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &DnsRecord,
    ) -> DeployResult<DnsRecord>;

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> DeployResult<()>;
}

/// Cloudflare v4 API 响应信封
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    total_pages: u32,
}

/// 串联错误对象中的 message 字段
fn join_messages(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "unknown provider error".to_string();
    }
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cloudflare API 客户端
#[derive(Clone)]
pub struct CloudflareApi {
    client: Client,
    base_url: String,
    api_token: String,
    email: Option<String>,
}

impl CloudflareApi {
    pub fn new(api_token: impl Into<String>, email: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: api_token.into(),
            email,
        }
    }

    /// 覆盖 API 基地址（测试用）
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(&self.api_token)
            .timeout(Duration::from_secs(10));
        if let Some(ref email) = self.email {
            builder = builder.header("X-Auth-Email", email);
        }
        builder
    }

    /// 发送请求并解包信封；非成功响应 → DnsProvider 错误
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> DeployResult<ApiEnvelope<T>> {
        let response = builder
            .send()
            .await
            .map_err(|e| DeployError::DnsProvider(format!("request failed: {}", e)))?;

        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| DeployError::DnsProvider(format!("invalid response body: {}", e)))?;

        if !envelope.success {
            return Err(DeployError::DnsProvider(join_messages(&envelope.errors)));
        }
        debug!(status = %status, "Cloudflare API call succeeded");
        Ok(envelope)
    }

    /// 翻页扫描全部 zone，直到精确命中
    async fn scan_zones(&self, domain: &str) -> DeployResult<Option<DnsZone>> {
        let mut page = 1u32;
        loop {
            let envelope: ApiEnvelope<Vec<DnsZone>> = self
                .send(self.request(reqwest::Method::GET, &format!("/zones?page={}", page)))
                .await?;

            let zones = envelope.result.unwrap_or_default();
            if let Some(zone) = zones.into_iter().find(|z| z.name == domain) {
                return Ok(Some(zone));
            }

            let total_pages = envelope
                .result_info
                .as_ref()
                .map(|info| info.total_pages)
                .unwrap_or(1);
            if page >= total_pages {
                return Ok(None);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl DnsProvider for CloudflareApi {
    async fn find_zone(&self, domain: &str) -> DeployResult<Option<DnsZone>> {
        // 优先直接按名称查询
        let direct: DeployResult<ApiEnvelope<Vec<DnsZone>>> = self
            .send(self.request(reqwest::Method::GET, &format!("/zones?name={}", domain)))
            .await;

        match direct {
            Ok(envelope) => {
                let zones = envelope.result.unwrap_or_default();
                if let Some(zone) = zones.into_iter().find(|z| z.name == domain) {
                    info!(zone = %zone.name, zone_id = %zone.id, "Found zone by direct lookup");
                    return Ok(Some(zone));
                }
            }
            Err(e) => {
                debug!(error = %e, "Direct zone lookup failed, falling back to full scan");
            }
        }

        // 回退：线性扫描分页列表
        self.scan_zones(domain).await
    }

    async fn list_records(
        &self,
        zone_id: &str,
        kind: RecordKind,
        name: Option<&str>,
    ) -> DeployResult<Vec<DnsRecord>> {
        let mut path = format!("/zones/{}/dns_records?type={}", zone_id, kind.as_str());
        if let Some(name) = name {
            path.push_str(&format!("&name={}", name));
        }
        let envelope: ApiEnvelope<Vec<DnsRecord>> =
            self.send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(envelope.result.unwrap_or_default())
    }

    async fn create_record(&self, zone_id: &str, record: &DnsRecord) -> DeployResult<DnsRecord> {
        let envelope: ApiEnvelope<DnsRecord> = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/zones/{}/dns_records", zone_id),
                )
                .json(record),
            )
            .await?;
        envelope
            .result
            .ok_or_else(|| DeployError::DnsProvider("create returned no record".to_string()))
    }

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &DnsRecord,
    ) -> DeployResult<DnsRecord> {
        let envelope: ApiEnvelope<DnsRecord> = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("/zones/{}/dns_records/{}", zone_id, record_id),
                )
                .json(record),
            )
            .await?;
        envelope
            .result
            .ok_or_else(|| DeployError::DnsProvider("update returned no record".to_string()))
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> DeployResult<()> {
        let _: ApiEnvelope<serde_json::Value> = self
            .send(self.request(
                reqwest::Method::DELETE,
                &format!("/zones/{}/dns_records/{}", zone_id, record_id),
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_messages_are_joined() {
        let errors = vec![
            ApiMessage {
                message: "Invalid record name".to_string(),
            },
            ApiMessage {
                message: "Quota exceeded".to_string(),
            },
        ];
        assert_eq!(join_messages(&errors), "Invalid record name; Quota exceeded");
        assert_eq!(join_messages(&[]), "unknown provider error");
    }

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{
            "success": true,
            "errors": [],
            "result": [{"id": "abc123", "name": "example.com"}],
            "result_info": {"page": 1, "per_page": 20, "total_pages": 3}
        }"#;
        let envelope: ApiEnvelope<Vec<DnsZone>> = serde_json::from_str(json).unwrap();
        assert!(envelope.success);
        let zones = envelope.result.unwrap();
        assert_eq!(zones[0].id, "abc123");
        assert_eq!(envelope.result_info.unwrap().total_pages, 3);
    }

    #[test]
    fn test_failure_envelope_deserialization() {
        let json = r#"{
            "success": false,
            "errors": [{"code": 81057, "message": "Record already exists"}],
            "result": null
        }"#;
        let envelope: ApiEnvelope<DnsRecord> = serde_json::from_str(json).unwrap();
        assert!(!envelope.success);
        assert_eq!(join_messages(&envelope.errors), "Record already exists");
    }

    #[test]
    fn test_record_payload_shape() {
        let json = r#"{
            "id": "rec1",
            "name": "app.example.com",
            "type": "A",
            "content": "203.0.113.10",
            "ttl": 300,
            "proxied": true
        }"#;
        let record: DnsRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, RecordKind::A);
        assert_eq!(record.id.as_deref(), Some("rec1"));
    }
}

//! DNS 记录调和
//!
//! 让域名及固定子域集合解析到目标地址，不触碰无关记录。
//! 单条记录的失败只记录、不致命；两次连续调用同样输入时，
//! 第二次不产生任何写操作（幂等契约）。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::constants::DNS_PROPAGATION_DELAY_SECS;
use crate::domain::dns::{desired_names, DnsRecord, RecordKind};
use crate::error::{DeployError, DeployResult};
use crate::infra::cloudflare::DnsProvider;
use crate::state::ProgressReporter;

/// 域名解析接口（系统解析器的测试缝）
#[async_trait]
pub trait Resolve: Send + Sync {
    /// 解析失败返回 None，从不报错
    async fn resolve(&self, name: &str) -> Option<Vec<IpAddr>>;
}

/// 走系统解析器
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, name: &str) -> Option<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host(format!("{}:0", name)).await.ok()?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            None
        } else {
            Some(ips)
        }
    }
}

/// DNS 调和器
pub struct DnsReconciler {
    provider: Arc<dyn DnsProvider>,
    resolver: Arc<dyn Resolve>,
    ttl: u32,
    proxied: bool,
    /// 调和后的传播等待；测试注入零值
    propagation_delay: Duration,
}

impl DnsReconciler {
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self {
            provider,
            resolver: Arc::new(SystemResolver),
            ttl: 300,
            proxied: true,
            propagation_delay: Duration::from_secs(DNS_PROPAGATION_DELAY_SECS),
        }
    }

    pub fn with_record_options(mut self, ttl: u32, proxied: bool) -> Self {
        self.ttl = ttl;
        self.proxied = proxied;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// 调和域名及其子域的记录，返回最终达到期望状态的记录列表
    ///
    /// 部分成功对调用方可见：失败的名称被跳过并记录，
    /// 不会把整体调和伪装成全败或全成
    pub async fn reconcile(
        &self,
        domain: &str,
        address: IpAddr,
        progress: &ProgressReporter,
    ) -> DeployResult<Vec<DnsRecord>> {
        let zone = self
            .provider
            .find_zone(domain)
            .await?
            .ok_or_else(|| DeployError::ZoneNotFound(domain.to_string()))?;

        let kind = RecordKind::for_address(&address);
        let content = address.to_string();
        let mut reconciled = Vec::new();

        for name in desired_names(domain) {
            match self
                .reconcile_one(&zone.id, &name, kind, &content, progress)
                .await
            {
                Ok(record) => reconciled.push(record),
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to reconcile DNS record, skipping");
                    progress.emit(
                        "dns_reconcile",
                        format!("Failed to reconcile {}: {}", name, e),
                    );
                }
            }
        }

        info!(
            domain = %domain,
            reconciled = reconciled.len(),
            "DNS reconciliation finished"
        );

        // 给提供商留出传播时间，否则紧随其后的验证会与传播竞速
        if !self.propagation_delay.is_zero() {
            tokio::time::sleep(self.propagation_delay).await;
        }

        Ok(reconciled)
    }

    async fn reconcile_one(
        &self,
        zone_id: &str,
        name: &str,
        kind: RecordKind,
        content: &str,
        progress: &ProgressReporter,
    ) -> DeployResult<DnsRecord> {
        // 同名同类型按一条为准；提供商返回多条时取第一条
        let existing = self
            .provider
            .list_records(zone_id, kind, Some(name))
            .await?
            .into_iter()
            .next();

        let desired = DnsRecord::desired(name, kind, content)
            .with_ttl(self.ttl)
            .with_proxied(self.proxied);

        match existing {
            None => {
                let created = self.provider.create_record(zone_id, &desired).await?;
                progress.emit(
                    "dns_reconcile",
                    format!("Created {} record: {} -> {}", kind.as_str(), name, content),
                );
                Ok(created)
            }
            Some(record) if record.content != content => {
                let record_id = record.id.clone().ok_or_else(|| {
                    DeployError::DnsProvider(format!("record {} has no provider id", name))
                })?;
                // 原地更新，保留提供商标识
                let updated = self
                    .provider
                    .update_record(zone_id, &record_id, &desired)
                    .await?;
                progress.emit(
                    "dns_reconcile",
                    format!(
                        "Updated {} record: {} {} -> {}",
                        kind.as_str(),
                        name,
                        record.content,
                        content
                    ),
                );
                Ok(updated)
            }
            Some(record) => {
                progress.emit(
                    "dns_reconcile",
                    format!("Already configured: {} -> {}", name, content),
                );
                Ok(record)
            }
        }
    }

    /// 验证传播状态：逐名解析并与期望地址比对
    ///
    /// 解析失败计为 false，从不报错
    pub async fn verify_propagation(
        &self,
        domain: &str,
        expected: IpAddr,
    ) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for name in desired_names(domain) {
            let matched = self
                .resolver
                .resolve(&name)
                .await
                .map_or(false, |ips| ips.contains(&expected));
            if !matched {
                warn!(name = %name, expected = %expected, "DNS name not propagated yet");
            }
            results.insert(name, matched);
        }
        results
    }

    /// 清除部署创建的子域记录（app/site/api），主域与 www 保留
    ///
    /// 与调和同样的容错策略：单条失败跳过
    pub async fn cleanup_records(&self, domain: &str) -> DeployResult<usize> {
        let zone = self
            .provider
            .find_zone(domain)
            .await?
            .ok_or_else(|| DeployError::ZoneNotFound(domain.to_string()))?;

        let mut removed = 0;
        for sub in ["app", "site", "api"] {
            let name = format!("{}.{}", sub, domain);
            // 调和可能写过 A 或 AAAA（取决于目标地址族），两种都清
            for kind in [RecordKind::A, RecordKind::AAAA] {
                let result: DeployResult<bool> = async {
                    let existing = self
                        .provider
                        .list_records(&zone.id, kind, Some(&name))
                        .await?
                        .into_iter()
                        .next();
                    if let Some(record) = existing {
                        if let Some(id) = record.id {
                            self.provider.delete_record(&zone.id, &id).await?;
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                .await;

                match result {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(name = %name, kind = kind.as_str(), error = %e, "Failed to remove DNS record, skipping")
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dns::DnsZone;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// 内存 DNS 提供商：记录写操作次数，可按名称注入失败
    struct MockProvider {
        zone: Option<DnsZone>,
        records: Mutex<Vec<DnsRecord>>,
        fail_names: HashSet<String>,
        writes: Mutex<u32>,
        next_id: Mutex<u32>,
    }

    impl MockProvider {
        fn with_zone(records: Vec<DnsRecord>) -> Self {
            Self {
                zone: Some(DnsZone {
                    id: "zone-1".to_string(),
                    name: "example.com".to_string(),
                }),
                records: Mutex::new(records),
                fail_names: HashSet::new(),
                writes: Mutex::new(0),
                next_id: Mutex::new(0),
            }
        }

        fn failing_on(mut self, name: &str) -> Self {
            self.fail_names.insert(name.to_string());
            self
        }

        fn write_count(&self) -> u32 {
            *self.writes.lock().unwrap()
        }
    }

    #[async_trait]
    impl DnsProvider for MockProvider {
        async fn find_zone(&self, domain: &str) -> DeployResult<Option<DnsZone>> {
            Ok(self.zone.clone().filter(|z| z.name == domain))
        }

        async fn list_records(
            &self,
            _zone_id: &str,
            kind: RecordKind,
            name: Option<&str>,
        ) -> DeployResult<Vec<DnsRecord>> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|r| r.kind == kind && name.map_or(true, |n| r.name == n))
                .cloned()
                .collect())
        }

        async fn create_record(
            &self,
            _zone_id: &str,
            record: &DnsRecord,
        ) -> DeployResult<DnsRecord> {
            if self.fail_names.contains(&record.name) {
                return Err(DeployError::DnsProvider("quota exceeded".to_string()));
            }
            *self.writes.lock().unwrap() += 1;
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let mut created = record.clone();
            created.id = Some(format!("rec-{}", next_id));
            self.records.lock().unwrap().push(created.clone());
            Ok(created)
        }

        async fn update_record(
            &self,
            _zone_id: &str,
            record_id: &str,
            record: &DnsRecord,
        ) -> DeployResult<DnsRecord> {
            if self.fail_names.contains(&record.name) {
                return Err(DeployError::DnsProvider("quota exceeded".to_string()));
            }
            *self.writes.lock().unwrap() += 1;
            let mut records = self.records.lock().unwrap();
            let stored = records
                .iter_mut()
                .find(|r| r.id.as_deref() == Some(record_id))
                .expect("update of unknown record");
            stored.content = record.content.clone();
            stored.ttl = record.ttl;
            stored.proxied = record.proxied;
            Ok(stored.clone())
        }

        async fn delete_record(&self, _zone_id: &str, record_id: &str) -> DeployResult<()> {
            *self.writes.lock().unwrap() += 1;
            self.records
                .lock()
                .unwrap()
                .retain(|r| r.id.as_deref() != Some(record_id));
            Ok(())
        }
    }

    fn reconciler(provider: Arc<MockProvider>) -> DnsReconciler {
        DnsReconciler::new(provider)
            .with_propagation_delay(Duration::from_secs(0))
            .with_record_options(300, true)
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))
    }

    #[tokio::test]
    async fn test_reconcile_creates_and_updates() {
        // zone 预置一条指向旧地址的主域记录
        let stale = DnsRecord {
            id: Some("rec-root".to_string()),
            name: "example.com".to_string(),
            kind: RecordKind::A,
            content: "203.0.113.9".to_string(),
            ttl: 300,
            proxied: true,
        };
        let provider = Arc::new(MockProvider::with_zone(vec![stale]));
        let reconciler = reconciler(provider.clone());
        let progress = ProgressReporter::detached("run-1");

        let records = reconciler
            .reconcile("example.com", ip(), &progress)
            .await
            .unwrap();

        // 主域被原地更新，四个子域被创建
        assert_eq!(records.len(), 5);
        assert_eq!(provider.write_count(), 5);
        let root = records.iter().find(|r| r.name == "example.com").unwrap();
        assert_eq!(root.content, "203.0.113.10");
        assert_eq!(root.id.as_deref(), Some("rec-root"));
        assert!(records.iter().any(|r| r.name == "api.example.com"));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let provider = Arc::new(MockProvider::with_zone(vec![]));
        let reconciler = reconciler(provider.clone());
        let progress = ProgressReporter::detached("run-1");

        reconciler
            .reconcile("example.com", ip(), &progress)
            .await
            .unwrap();
        let first_writes = provider.write_count();
        assert_eq!(first_writes, 5);

        // 第二次调用不得产生任何写操作
        let records = reconciler
            .reconcile("example.com", ip(), &progress)
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(provider.write_count(), first_writes);
    }

    #[tokio::test]
    async fn test_partial_failure_is_visible_not_fatal() {
        let provider =
            Arc::new(MockProvider::with_zone(vec![]).failing_on("api.example.com"));
        let reconciler = reconciler(provider.clone());
        let progress = ProgressReporter::detached("run-1");

        let records = reconciler
            .reconcile("example.com", ip(), &progress)
            .await
            .unwrap();

        // api 失败被跳过，其余四条成功
        assert_eq!(records.len(), 4);
        assert!(!records.iter().any(|r| r.name == "api.example.com"));
    }

    #[tokio::test]
    async fn test_missing_zone_is_fatal() {
        let provider = Arc::new(MockProvider::with_zone(vec![]));
        let reconciler = reconciler(provider);
        let progress = ProgressReporter::detached("run-1");

        let err = reconciler
            .reconcile("other.org", ip(), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ZoneNotFound(_)));
    }

    struct FixedResolver {
        answers: HashMap<String, IpAddr>,
    }

    #[async_trait]
    impl Resolve for FixedResolver {
        async fn resolve(&self, name: &str) -> Option<Vec<IpAddr>> {
            self.answers.get(name).map(|ip| vec![*ip])
        }
    }

    #[tokio::test]
    async fn test_verify_propagation_never_raises() {
        let provider = Arc::new(MockProvider::with_zone(vec![]));
        let mut answers = HashMap::new();
        answers.insert("example.com".to_string(), ip());
        answers.insert(
            "www.example.com".to_string(),
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
        );
        // 其余名称解析失败

        let reconciler =
            reconciler(provider).with_resolver(Arc::new(FixedResolver { answers }));

        let results = reconciler.verify_propagation("example.com", ip()).await;
        assert_eq!(results.len(), 5);
        assert!(results["example.com"]);
        assert!(!results["www.example.com"]); // 指向了别的地址
        assert!(!results["app.example.com"]); // 解析失败计为 false
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_subdomains() {
        let records = vec![
            DnsRecord {
                id: Some("rec-root".to_string()),
                name: "example.com".to_string(),
                kind: RecordKind::A,
                content: "203.0.113.10".to_string(),
                ttl: 300,
                proxied: true,
            },
            DnsRecord {
                id: Some("rec-app".to_string()),
                name: "app.example.com".to_string(),
                kind: RecordKind::A,
                content: "203.0.113.10".to_string(),
                ttl: 300,
                proxied: true,
            },
        ];
        let provider = Arc::new(MockProvider::with_zone(records));
        let reconciler = reconciler(provider.clone());

        let removed = reconciler.cleanup_records("example.com").await.unwrap();
        assert_eq!(removed, 1);

        let remaining = provider.records.lock().unwrap();
        assert!(remaining.iter().any(|r| r.name == "example.com"));
        assert!(!remaining.iter().any(|r| r.name == "app.example.com"));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_aaaa_records() {
        // IPv6 目标调和出的是 AAAA 记录
        let records = vec![DnsRecord {
            id: Some("rec-site-v6".to_string()),
            name: "site.example.com".to_string(),
            kind: RecordKind::AAAA,
            content: "2001:db8::10".to_string(),
            ttl: 300,
            proxied: true,
        }];
        let provider = Arc::new(MockProvider::with_zone(records));
        let reconciler = reconciler(provider.clone());

        let removed = reconciler.cleanup_records("example.com").await.unwrap();
        assert_eq!(removed, 1);
        assert!(provider.records.lock().unwrap().is_empty());
    }
}

//! 部署协调器
//!
//! 驱动固定阶段顺序的状态机：连接、DNS 调和、主机准备、产物传输、
//! 容器编排、验证。任一阶段失败即终止并原样记录错误；
//! 取消只在阶段边界生效；远程会话在所有退出路径上释放。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::constants::CONTAINER_SETTLE_SECS;
use crate::config::EnvConfig;
use crate::domain::deploy::{
    build_service_set, DeploymentRun, DeploymentTarget, LogLine, ProgressEvent, RunPhase,
    ServiceDescriptor, ServiceSource, VerificationReport,
};
use crate::error::{DeployError, DeployResult};
use crate::infra::cloudflare::CloudflareApi;
use crate::infra::ssh::{RemoteSession, SessionFactory, SshSessionFactory};
use crate::services::dns::DnsReconciler;
use crate::services::orchestrator::{ContainerOrchestrator, EDGE_CONFIG_FILE, MANIFEST_FILE};
use crate::services::transfer::ArtifactTransfer;
use crate::state::{EventHub, ProgressReporter, RunStore};

/// 部署前确认回调
///
/// 在第一阶段开始前调用一次；返回 false 时 run 被取消。
/// 管线内部不做任何交互，确认完全由调用方实现
#[async_trait]
pub trait PreflightHook: Send + Sync {
    async fn confirm(&self, run: &DeploymentRun) -> bool;
}

/// 部署协调器
pub struct DeploymentCoordinator {
    runs: RunStore,
    events: EventHub,
    reconciler: Arc<DnsReconciler>,
    sessions: Arc<dyn SessionFactory>,
    config: EnvConfig,
    preflight: Option<Arc<dyn PreflightHook>>,
    settle_delay: Duration,
}

impl DeploymentCoordinator {
    pub fn new(
        reconciler: Arc<DnsReconciler>,
        sessions: Arc<dyn SessionFactory>,
        config: EnvConfig,
    ) -> Self {
        Self {
            runs: RunStore::new(),
            events: EventHub::new(),
            reconciler,
            sessions,
            config,
            preflight: None,
            settle_delay: Duration::from_secs(CONTAINER_SETTLE_SECS),
        }
    }

    /// 按环境配置组装生产栈：Cloudflare 提供商 + russh 会话工厂
    pub fn from_env() -> DeployResult<Self> {
        let config = EnvConfig::from_env();
        let token = config.cloudflare_api_token.clone().ok_or_else(|| {
            DeployError::DnsProvider("CLOUDFLARE_API_TOKEN is not set".to_string())
        })?;
        let provider = Arc::new(CloudflareApi::new(token, config.cloudflare_email.clone()));
        let reconciler = Arc::new(
            DnsReconciler::new(provider)
                .with_record_options(config.cloudflare_ttl, config.cloudflare_proxy_enabled),
        );
        Ok(Self::new(reconciler, Arc::new(SshSessionFactory), config))
    }

    pub fn with_preflight(mut self, hook: Arc<dyn PreflightHook>) -> Self {
        self.preflight = Some(hook);
        self
    }

    /// 覆盖容器稳定等待（测试用）
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// 登记一次新部署，返回 run id
    ///
    /// 描述符在这里校验完毕；之后的 run 只消费已验证的拓扑
    pub async fn start(
        &self,
        target: DeploymentTarget,
        services: Vec<ServiceDescriptor>,
    ) -> DeployResult<String> {
        let services = build_service_set(services)?;
        let run = DeploymentRun::new(target, services);
        let run_id = run.id.clone();

        self.events.create(&run_id).await;
        self.runs.insert(run).await;
        info!(run_id = %run_id, "Deployment run registered");
        Ok(run_id)
    }

    /// 执行已登记的 run 直到终态
    ///
    /// 管线自身的失败不通过返回值上抛，而是落入 run 记录；
    /// 返回 Err 仅当 run id 不存在
    pub async fn execute(&self, run_id: &str) -> DeployResult<()> {
        let run = self
            .runs
            .get(run_id)
            .await
            .ok_or_else(|| DeployError::RunNotFound(run_id.to_string()))?;
        let cancel = self
            .runs
            .cancel_token(run_id)
            .await
            .ok_or_else(|| DeployError::RunNotFound(run_id.to_string()))?;
        let progress = match self.events.get_sender(run_id).await {
            Some(sender) => ProgressReporter::new(run_id, sender),
            None => ProgressReporter::detached(run_id),
        };

        if let Some(hook) = &self.preflight {
            if !hook.confirm(&run).await {
                self.runs.cancel(run_id).await;
                progress.emit("cancelled", "Deployment declined before start");
                self.events.finish(run_id).await;
                return Ok(());
            }
        }

        // 只有 queued 状态的 run 能被接管：start 与 execute 之间
        // 可能已被取消，也可能已有别的执行方在驱动同一 run
        if !self.runs.mark_running(run_id).await {
            let terminal = self
                .runs
                .get(run_id)
                .await
                .map_or(true, |r| r.status.is_terminal());
            if terminal {
                self.events.finish(run_id).await;
            }
            return Ok(());
        }
        progress.emit("running", format!("Deploying {}", run.target.domain));

        match self.run_pipeline(&run, &cancel, &progress).await {
            Ok(report) => {
                self.runs.mark_completed(run_id).await;
                let message = match report.warning {
                    Some(warning) => format!("Deployment completed ({})", warning),
                    None => "Deployment completed".to_string(),
                };
                progress.emit("completed", message);
            }
            Err(DeployError::Cancelled) => {
                // 取消方已落终态；这里只收尾
                self.runs.cancel(run_id).await;
                progress.emit("cancelled", "Deployment cancelled");
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, kind = e.kind(), "Deployment failed");
                self.runs.mark_failed(run_id, e.to_string()).await;
                progress.emit("failed", e.to_string());
            }
        }

        self.events.finish(run_id).await;
        Ok(())
    }

    /// 请求取消；终态 run 返回 false
    pub async fn cancel(&self, run_id: &str) -> bool {
        self.runs.cancel(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Option<DeploymentRun> {
        self.runs.get(run_id).await
    }

    pub async fn list_runs(&self) -> Vec<DeploymentRun> {
        self.runs.list().await
    }

    /// 驱逐单个 run 记录（只对已结束的 run 有意义）
    pub async fn remove_run(&self, run_id: &str) -> Option<DeploymentRun> {
        self.events.cleanup().await;
        self.runs.remove(run_id).await
    }

    pub async fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.events.subscribe(run_id).await
    }

    /// 查询远端栈状态（独立于任何 run）
    pub async fn status(&self, target: &DeploymentTarget) -> DeployResult<VerificationReport> {
        let mut session = self.sessions.connect(target).await?;
        let orchestrator = self.orchestrator();
        let result = orchestrator.verify(&mut *session).await;
        self.release(&mut *session).await;
        result
    }

    /// 拉取远端容器日志
    pub async fn logs(
        &self,
        target: &DeploymentTarget,
        service: Option<&str>,
    ) -> DeployResult<String> {
        let mut session = self.sessions.connect(target).await?;
        let orchestrator = self.orchestrator();
        let result = orchestrator.logs(&mut *session, service).await;
        self.release(&mut *session).await;
        result
    }

    /// 跟随远端容器日志流；取消令牌在数据块之间生效
    pub async fn follow_logs(
        &self,
        target: &DeploymentTarget,
        service: Option<&str>,
        tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> DeployResult<Option<u32>> {
        let mut session = self.sessions.connect(target).await?;
        let orchestrator = self.orchestrator();
        let result = orchestrator
            .follow_logs(&mut *session, service, tx, cancel)
            .await;
        self.release(&mut *session).await;
        result
    }

    /// 停止远端容器栈
    pub async fn stop(&self, target: &DeploymentTarget) -> DeployResult<()> {
        let mut session = self.sessions.connect(target).await?;
        let orchestrator = self.orchestrator();
        let result = orchestrator.stop(&mut *session).await;
        self.release(&mut *session).await;
        result
    }

    async fn run_pipeline(
        &self,
        run: &DeploymentRun,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> DeployResult<VerificationReport> {
        self.enter_phase(&run.id, RunPhase::Connect, cancel, progress)
            .await?;
        let mut session = self.sessions.connect(&run.target).await?;
        progress.emit(
            RunPhase::Connect.as_str(),
            format!("Connected to {}", run.target.address),
        );

        let result = self
            .run_remote_phases(run, &mut *session, cancel, progress)
            .await;
        self.release(&mut *session).await;
        result
    }

    async fn run_remote_phases(
        &self,
        run: &DeploymentRun,
        session: &mut dyn RemoteSession,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> DeployResult<VerificationReport> {
        let run_id = &run.id;
        let target = &run.target;
        let remote_root = self.config.remote_root();

        self.enter_phase(run_id, RunPhase::DnsReconcile, cancel, progress)
            .await?;
        let records = self
            .reconciler
            .reconcile(&target.domain, target.address, progress)
            .await?;
        progress.emit(
            RunPhase::DnsReconcile.as_str(),
            format!("{} DNS records at desired state", records.len()),
        );

        self.enter_phase(run_id, RunPhase::HostPrepare, cancel, progress)
            .await?;
        self.prepare_host(session, target, &remote_root).await?;

        self.enter_phase(run_id, RunPhase::Transfer, cancel, progress)
            .await?;
        let contexts: Vec<PathBuf> = run
            .services
            .values()
            .filter_map(|svc| match &svc.source {
                ServiceSource::Build(path) => Some(path.clone()),
                ServiceSource::Image(_) => None,
            })
            .collect();
        let uploaded = ArtifactTransfer::upload(session, &[], &contexts, &remote_root).await?;
        progress.emit(
            RunPhase::Transfer.as_str(),
            format!("Uploaded {} files", uploaded),
        );

        self.enter_phase(run_id, RunPhase::Orchestrate, cancel, progress)
            .await?;
        let manifest = ContainerOrchestrator::render_manifest(&run.services)?;
        let ssl_email = self.config.ssl_email_or_default(&target.domain);
        let edge_config =
            ContainerOrchestrator::render_edge_config(&run.services, target, &ssl_email)?;
        session
            .write_file(
                &format!("{}/{}", remote_root, MANIFEST_FILE),
                manifest.as_bytes(),
            )
            .await?;
        session
            .write_file(
                &format!("{}/{}", remote_root, EDGE_CONFIG_FILE),
                edge_config.as_bytes(),
            )
            .await?;
        let orchestrator = self.orchestrator();
        orchestrator.restart(session).await?;
        progress.emit(RunPhase::Orchestrate.as_str(), "Container stack started");

        self.enter_phase(run_id, RunPhase::Verify, cancel, progress)
            .await?;
        let report = orchestrator.verify(session).await?;
        if let Some(warning) = &report.warning {
            // 证书判定只是启发式信号，不升级为失败
            progress.emit(RunPhase::Verify.as_str(), warning.clone());
        }
        Ok(report)
    }

    /// 主机准备：保证 docker 可用、项目目录存在、.env 就位
    async fn prepare_host(
        &self,
        session: &mut dyn RemoteSession,
        target: &DeploymentTarget,
        remote_root: &str,
    ) -> DeployResult<()> {
        let output = session
            .execute("which docker || curl -fsSL https://get.docker.com | sh")
            .await?;
        if !output.success() {
            return Err(DeployError::Orchestration(format!(
                "docker is unavailable on the host: {}",
                output.stderr.trim()
            )));
        }

        session.ensure_dir(remote_root).await?;

        let env_file = format!(
            "DOMAIN={}\nDB_PASSWORD={}\n",
            target.domain,
            generated_secret(32)
        );
        session
            .write_file(&format!("{}/.env", remote_root), env_file.as_bytes())
            .await
    }

    /// 阶段边界：检查取消，推进阶段并发进度事件
    async fn enter_phase(
        &self,
        run_id: &str,
        phase: RunPhase,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> DeployResult<()> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        self.runs.set_phase(run_id, phase).await;
        progress.emit(phase.as_str(), format!("Entering {}", phase.as_str()));
        Ok(())
    }

    fn orchestrator(&self) -> ContainerOrchestrator {
        ContainerOrchestrator::new(self.config.remote_root()).with_settle_delay(self.settle_delay)
    }

    async fn release(&self, session: &mut dyn RemoteSession) {
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close remote session");
        }
    }
}

/// 随机字母数字密钥
fn generated_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

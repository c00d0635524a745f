//! 容器栈编排
//!
//! 从服务拓扑确定性地渲染 compose 清单与边缘代理配置，
//! 并通过远程会话驱动 docker compose 的启停、验证与日志。
//! 渲染是纯函数：相同拓扑必然产出字节级相同的文本。

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::constants::CONTAINER_SETTLE_SECS;
use crate::domain::deploy::{
    DeploymentTarget, LogLine, ServiceDescriptor, ServiceSet, ServiceSource, VerificationReport,
};
use crate::error::{DeployError, DeployResult};
use crate::infra::shell::{compose_command, sh_quote};
use crate::infra::ssh::RemoteSession;

/// 远端 compose 清单文件名
pub const MANIFEST_FILE: &str = "docker-compose.prod.yml";
/// 远端边缘代理配置文件名
pub const EDGE_CONFIG_FILE: &str = "Caddyfile.prod";
/// 边缘代理服务名
pub const EDGE_SERVICE: &str = "caddy";

/// 容器编排器
pub struct ContainerOrchestrator {
    remote_root: String,
    settle_delay: Duration,
}

impl ContainerOrchestrator {
    pub fn new(remote_root: impl Into<String>) -> Self {
        Self {
            remote_root: remote_root.into(),
            settle_delay: Duration::from_secs(CONTAINER_SETTLE_SECS),
        }
    }

    /// 覆盖容器启动后的稳定等待时间（测试用）
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// 渲染 compose 清单
    ///
    /// 边缘代理服务固定在最前，依赖所有带子域名的服务；
    /// 非 internal 服务依赖所有 internal 服务；
    /// internal 服务获得命名卷。拓扑不变量被破坏时返回错误
    pub fn render_manifest(services: &ServiceSet) -> DeployResult<String> {
        validate_topology(services)?;

        let routed: Vec<&ServiceDescriptor> =
            services.values().filter(|s| s.subdomain.is_some()).collect();
        let internal: Vec<&ServiceDescriptor> =
            services.values().filter(|s| s.internal).collect();

        let mut out = String::from("version: '3.8'\n\nservices:\n");

        out.push_str(&format!(
            "  {name}:\n\
             \x20   image: caddy:2-alpine\n\
             \x20   container_name: {name}\n\
             \x20   restart: unless-stopped\n\
             \x20   ports:\n\
             \x20     - \"80:80\"\n\
             \x20     - \"443:443\"\n\
             \x20   volumes:\n\
             \x20     - ./{edge_config}:/etc/caddy/Caddyfile\n\
             \x20     - caddy_data:/data\n\
             \x20     - caddy_config:/config\n\
             \x20   networks:\n\
             \x20     - app-network\n",
            name = EDGE_SERVICE,
            edge_config = EDGE_CONFIG_FILE,
        ));
        if !routed.is_empty() {
            out.push_str("    depends_on:\n");
            for svc in &routed {
                out.push_str(&format!("      - {}\n", svc.name));
            }
        }

        for svc in services.values() {
            out.push('\n');
            out.push_str(&format!("  {}:\n", svc.name));
            match &svc.source {
                ServiceSource::Build(path) => {
                    out.push_str(&format!("    build: ./{}\n", context_dir_name(path)));
                }
                ServiceSource::Image(image) => {
                    out.push_str(&format!("    image: {}\n", image));
                }
            }
            out.push_str(&format!(
                "    container_name: {name}\n\
                 \x20   hostname: {name}\n\
                 \x20   restart: unless-stopped\n\
                 \x20   env_file:\n\
                 \x20     - .env\n",
                name = svc.name,
            ));
            if svc.internal {
                out.push_str(&format!(
                    "    volumes:\n      - {name}_data:/var/lib/{name}/data\n",
                    name = svc.name,
                ));
            }
            out.push_str("    networks:\n      - app-network\n");
            if !svc.internal && !internal.is_empty() {
                out.push_str("    depends_on:\n");
                for dep in &internal {
                    out.push_str(&format!("      - {}\n", dep.name));
                }
            }
        }

        out.push_str("\nnetworks:\n  app-network:\n    driver: bridge\n");
        out.push_str("\nvolumes:\n  caddy_data:\n  caddy_config:\n");
        for svc in &internal {
            out.push_str(&format!("  {}_data:\n", svc.name));
        }

        Ok(out)
    }

    /// 渲染边缘代理配置（Caddyfile）
    ///
    /// 每个带子域名的服务一个 reverse_proxy 块；api 子域名附带限流；
    /// 裸域名重定向到默认子域名（有 site 用 site，否则取字典序最小），
    /// www 重定向到裸域名。证书获取由远端代理自动完成，这里只声明邮箱
    pub fn render_edge_config(
        services: &ServiceSet,
        target: &DeploymentTarget,
        ssl_email: &str,
    ) -> DeployResult<String> {
        validate_topology(services)?;
        let domain = &target.domain;

        let mut routed: Vec<(&str, &ServiceDescriptor)> = services
            .values()
            .filter_map(|s| s.subdomain.as_deref().map(|sub| (sub, s)))
            .collect();
        routed.sort_by_key(|(sub, _)| *sub);

        let mut out = format!("{{\n    email {}\n}}\n", ssl_email);

        for (sub, svc) in &routed {
            out.push('\n');
            out.push_str(&format!("{}.{} {{\n", sub, domain));
            out.push_str(&format!("    reverse_proxy {}:{}\n", svc.name, svc.port));
            if *sub == "api" {
                out.push_str(
                    "\n    rate_limit {\n        zone api {\n            key {remote_host}\n\
                     \x20           events 100\n            window 1m\n        }\n    }\n",
                );
            } else {
                out.push_str(&format!(
                    "\n    log {{\n        output file /var/log/caddy/{}.log\n    }}\n",
                    sub
                ));
            }
            out.push_str("}\n");
        }

        if let Some(default_sub) = default_redirect_subdomain(&routed) {
            out.push_str(&format!(
                "\n{domain} {{\n    redir https://{sub}.{domain}{{uri}} permanent\n}}\n",
                domain = domain,
                sub = default_sub,
            ));
        }
        out.push_str(&format!(
            "\nwww.{domain} {{\n    redir https://{domain}{{uri}} permanent\n}}\n",
            domain = domain,
        ));

        Ok(out)
    }

    /// 重启容器栈：down 容错，up 必须成功，随后等待稳定窗口
    pub async fn restart(&self, session: &mut dyn RemoteSession) -> DeployResult<()> {
        let down = compose_command(&self.remote_root, MANIFEST_FILE, &["down"]);
        let output = session.execute(&down).await?;
        if !output.success() {
            // 首次部署时栈尚不存在，down 失败是预期内的
            info!(stderr = %output.stderr.trim(), "compose down reported failure, continuing");
        }

        let up = compose_command(&self.remote_root, MANIFEST_FILE, &["up", "-d", "--build"]);
        let output = session.execute(&up).await?;
        if !output.success() {
            return Err(DeployError::Orchestration(format!(
                "compose up failed (exit {:?}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        if !self.settle_delay.is_zero() {
            info!(secs = self.settle_delay.as_secs(), "Waiting for containers to settle");
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    /// 停止容器栈
    pub async fn stop(&self, session: &mut dyn RemoteSession) -> DeployResult<()> {
        let down = compose_command(&self.remote_root, MANIFEST_FILE, &["down"]);
        let output = session.execute(&down).await?;
        if !output.success() {
            return Err(DeployError::Orchestration(format!(
                "compose down failed (exit {:?}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// 验证部署结果
    ///
    /// 证书判定是对代理日志的文本启发式扫描，未命中只产生警告
    pub async fn verify(&self, session: &mut dyn RemoteSession) -> DeployResult<VerificationReport> {
        let ps = compose_command(&self.remote_root, MANIFEST_FILE, &["ps"]);
        let status = session.execute(&ps).await?;

        let tail = compose_command(
            &self.remote_root,
            MANIFEST_FILE,
            &["logs", "--tail=50", EDGE_SERVICE],
        );
        let logs = session.execute(&tail).await?;

        let combined = format!("{}\n{}", logs.stdout, logs.stderr).to_lowercase();
        let certificates_ready =
            combined.contains("certificate obtained") || combined.contains("serving");

        let warning = if certificates_ready {
            None
        } else {
            warn!("No certificate signal in proxy logs yet");
            Some("certificates may still be issuing".to_string())
        };

        Ok(VerificationReport {
            status_text: status.stdout,
            certificates_ready,
            warning,
        })
    }

    /// 一次性拉取容器日志
    ///
    /// 服务名是调用方输入，进入命令前必须经过引号包裹
    pub async fn logs(
        &self,
        session: &mut dyn RemoteSession,
        service: Option<&str>,
    ) -> DeployResult<String> {
        let quoted = service.map(sh_quote);
        let mut args = vec!["logs", "--tail=100"];
        if let Some(name) = quoted.as_deref() {
            args.push(name);
        }
        let cmd = compose_command(&self.remote_root, MANIFEST_FILE, &args);
        let output = session.execute(&cmd).await?;
        Ok(output.stdout)
    }

    /// 跟随容器日志流，取消令牌在数据块之间生效
    pub async fn follow_logs(
        &self,
        session: &mut dyn RemoteSession,
        service: Option<&str>,
        tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> DeployResult<Option<u32>> {
        let quoted = service.map(sh_quote);
        let mut args = vec!["logs", "-f", "--tail=100"];
        if let Some(name) = quoted.as_deref() {
            args.push(name);
        }
        let cmd = compose_command(&self.remote_root, MANIFEST_FILE, &args);
        session.execute_streaming(&cmd, tx, cancel).await
    }
}

/// 校验拓扑不变量：描述符自洽且子域名不冲突
fn validate_topology(services: &ServiceSet) -> DeployResult<()> {
    let mut seen = std::collections::BTreeMap::new();
    for svc in services.values() {
        svc.validate()?;
        if let Some(sub) = &svc.subdomain {
            if let Some(other) = seen.insert(sub.clone(), svc.name.clone()) {
                return Err(DeployError::ManifestRender(format!(
                    "subdomain {} claimed by both {} and {}",
                    sub, other, svc.name
                )));
            }
        }
    }
    Ok(())
}

/// 裸域名重定向的目标子域名
fn default_redirect_subdomain<'a>(routed: &[(&'a str, &ServiceDescriptor)]) -> Option<&'a str> {
    if routed.iter().any(|(sub, _)| *sub == "site") {
        return Some("site");
    }
    routed.first().map(|(sub, _)| *sub)
}

/// 构建上下文在远端项目根下的目录名
fn context_dir_name(path: &std::path::Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(".")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::domain::deploy::{build_service_set, AuthMethod};
    use crate::infra::ssh::CommandOutput;

    fn target() -> DeploymentTarget {
        DeploymentTarget::new(
            "example.com",
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            AuthMethod::None,
        )
    }

    fn sample_services() -> ServiceSet {
        build_service_set(vec![
            ServiceDescriptor::from_build("web-app", "./web-app", 5000).with_subdomain("app"),
            ServiceDescriptor::from_image("static-site", "nginx:alpine", 80)
                .with_subdomain("site"),
            ServiceDescriptor::from_image("database", "postgres:15-alpine", 5432).internal(),
        ])
        .unwrap()
    }

    /// 预置命令输出的假会话
    struct ScriptedSession {
        outputs: HashMap<String, CommandOutput>,
        executed: Vec<String>,
        default_exit: Option<u32>,
    }

    impl ScriptedSession {
        fn new() -> Self {
            Self {
                outputs: HashMap::new(),
                executed: Vec::new(),
                default_exit: Some(0),
            }
        }

        fn respond(mut self, fragment: &str, output: CommandOutput) -> Self {
            self.outputs.insert(fragment.to_string(), output);
            self
        }
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn execute(&mut self, command: &str) -> DeployResult<CommandOutput> {
            self.executed.push(command.to_string());
            for (fragment, output) in &self.outputs {
                if command.contains(fragment.as_str()) {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: self.default_exit,
            })
        }

        async fn execute_streaming(
            &mut self,
            command: &str,
            _tx: broadcast::Sender<LogLine>,
            _cancel: CancellationToken,
        ) -> DeployResult<Option<u32>> {
            self.executed.push(command.to_string());
            Ok(Some(0))
        }

        async fn write_file(&mut self, _remote_path: &str, _contents: &[u8]) -> DeployResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> DeployResult<()> {
            Ok(())
        }
    }

    fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    #[test]
    fn test_manifest_is_deterministic() {
        let services = sample_services();
        let a = ContainerOrchestrator::render_manifest(&services).unwrap();
        let b = ContainerOrchestrator::render_manifest(&services).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_manifest_topology() {
        let manifest = ContainerOrchestrator::render_manifest(&sample_services()).unwrap();

        assert!(manifest.contains("image: caddy:2-alpine"));
        assert!(manifest.contains("build: ./web-app"));
        assert!(manifest.contains("image: nginx:alpine"));
        assert!(manifest.contains("restart: unless-stopped"));
        // 边缘服务只依赖有路由的服务
        let caddy_block = &manifest[..manifest.find("\n\n  database:").unwrap()];
        assert!(caddy_block.contains("- static-site"));
        assert!(caddy_block.contains("- web-app"));
        assert!(!caddy_block.contains("- database"));
        // internal 服务拿到命名卷，应用服务依赖它
        assert!(manifest.contains("database_data:/var/lib/database/data"));
        assert!(manifest.ends_with("volumes:\n  caddy_data:\n  caddy_config:\n  database_data:\n"));
        let web_block = &manifest[manifest.find("  web-app:").unwrap()..];
        assert!(web_block.contains("- database"));
    }

    #[test]
    fn test_proxy_ignores_unrouted_services() {
        let services = build_service_set(vec![
            ServiceDescriptor::from_build("web", "./web", 5000).with_subdomain("app"),
            ServiceDescriptor::from_image("cache", "redis:7", 6379),
        ])
        .unwrap();
        let manifest = ContainerOrchestrator::render_manifest(&services).unwrap();

        // 无子域名也非 internal 的服务：在栈里，但边缘代理不依赖它
        let caddy_block = &manifest[..manifest.find("\n\n  cache:").unwrap()];
        assert!(caddy_block.contains("- web"));
        assert!(!caddy_block.contains("- cache"));
        assert!(manifest.contains("image: redis:7"));
        // 没有 internal 服务时不产生额外的命名卷
        assert!(manifest.ends_with("volumes:\n  caddy_data:\n  caddy_config:\n"));
    }

    #[test]
    fn test_manifest_rejects_duplicate_subdomain() {
        let mut services = sample_services();
        services.insert(
            "blog".to_string(),
            ServiceDescriptor::from_image("blog", "ghost:5", 2368).with_subdomain("app"),
        );
        let err = ContainerOrchestrator::render_manifest(&services).unwrap_err();
        assert!(matches!(err, DeployError::ManifestRender(_)));
        assert!(err.to_string().contains("subdomain app"));
    }

    #[test]
    fn test_edge_config_routes_and_redirects() {
        let config = ContainerOrchestrator::render_edge_config(
            &sample_services(),
            &target(),
            "admin@example.com",
        )
        .unwrap();

        assert!(config.starts_with("{\n    email admin@example.com\n}\n"));
        assert!(config.contains("app.example.com {\n    reverse_proxy web-app:5000"));
        assert!(config.contains("site.example.com {\n    reverse_proxy static-site:80"));
        // internal 服务没有路由
        assert!(!config.contains("database"));
        // 裸域名指向 site，www 指向裸域名
        assert!(config.contains("example.com {\n    redir https://site.example.com{uri} permanent"));
        assert!(config.contains("www.example.com {\n    redir https://example.com{uri} permanent"));
    }

    #[test]
    fn test_edge_config_api_rate_limit() {
        let services = build_service_set(vec![
            ServiceDescriptor::from_build("backend", "./backend", 8080).with_subdomain("api")
        ])
        .unwrap();
        let config =
            ContainerOrchestrator::render_edge_config(&services, &target(), "admin@example.com")
                .unwrap();

        assert!(config.contains("api.example.com {"));
        assert!(config.contains("rate_limit"));
        assert!(config.contains("events 100"));
        // 没有 site 子域名时裸域名落到字典序最小的子域名
        assert!(config.contains("redir https://api.example.com{uri} permanent"));
    }

    #[tokio::test]
    async fn test_restart_tolerates_down_failure() {
        let mut session = ScriptedSession::new().respond(
            "down",
            CommandOutput {
                stdout: String::new(),
                stderr: "no such file".to_string(),
                exit_code: Some(1),
            },
        );
        let orchestrator =
            ContainerOrchestrator::new("/opt/app").with_settle_delay(Duration::ZERO);

        orchestrator.restart(&mut session).await.unwrap();
        assert!(session.executed[0].contains("down"));
        assert!(session.executed[1].contains("up -d --build"));
    }

    #[tokio::test]
    async fn test_restart_fails_when_up_fails() {
        let mut session = ScriptedSession::new().respond(
            "up -d --build",
            CommandOutput {
                stdout: String::new(),
                stderr: "build failed".to_string(),
                exit_code: Some(17),
            },
        );
        let orchestrator =
            ContainerOrchestrator::new("/opt/app").with_settle_delay(Duration::ZERO);

        let err = orchestrator.restart(&mut session).await.unwrap_err();
        assert!(matches!(err, DeployError::Orchestration(_)));
        assert!(err.to_string().contains("build failed"));
    }

    #[tokio::test]
    async fn test_log_service_name_is_shell_quoted() {
        let mut session = ScriptedSession::new();
        let orchestrator =
            ContainerOrchestrator::new("/opt/app").with_settle_delay(Duration::ZERO);

        orchestrator
            .logs(&mut session, Some("web; touch /tmp/pwned"))
            .await
            .unwrap();

        // 分号等元字符不能原样进入远程 shell
        assert_eq!(
            session.executed[0],
            "cd /opt/app && docker compose -f docker-compose.prod.yml logs --tail=100 'web; touch /tmp/pwned'"
        );

        let (tx, _rx) = broadcast::channel(8);
        orchestrator
            .follow_logs(
                &mut session,
                Some("web; touch /tmp/pwned"),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(session.executed[1].ends_with("logs -f --tail=100 'web; touch /tmp/pwned'"));
    }

    #[tokio::test]
    async fn test_verify_reads_certificate_signal() {
        let mut session = ScriptedSession::new()
            .respond("ps", ok_output("NAME    STATUS\ncaddy   running"))
            .respond(
                "logs --tail=50",
                ok_output("2026/08/23 certificate obtained successfully for app.example.com"),
            );
        let orchestrator =
            ContainerOrchestrator::new("/opt/app").with_settle_delay(Duration::ZERO);

        let report = orchestrator.verify(&mut session).await.unwrap();
        assert!(report.certificates_ready);
        assert!(report.warning.is_none());
        assert!(report.status_text.contains("caddy"));
    }

    #[tokio::test]
    async fn test_verify_warns_without_signal() {
        let mut session = ScriptedSession::new()
            .respond("ps", ok_output("NAME    STATUS"))
            .respond("logs --tail=50", ok_output("waiting on ACME challenge"));
        let orchestrator =
            ContainerOrchestrator::new("/opt/app").with_settle_delay(Duration::ZERO);

        let report = orchestrator.verify(&mut session).await.unwrap();
        assert!(!report.certificates_ready);
        assert_eq!(
            report.warning.as_deref(),
            Some("certificates may still be issuing")
        );
    }
}

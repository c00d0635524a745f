//! 服务层：部署管线的各阶段组件

pub mod deploy;
pub mod dns;
pub mod orchestrator;
pub mod transfer;

pub use deploy::{DeploymentCoordinator, PreflightHook};
pub use dns::{DnsReconciler, Resolve, SystemResolver};
pub use orchestrator::ContainerOrchestrator;
pub use transfer::ArtifactTransfer;

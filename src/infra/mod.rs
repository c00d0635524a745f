//! 基础设施层：外部系统的接入点

pub mod cloudflare;
pub mod shell;
pub mod ssh;

pub use cloudflare::{CloudflareApi, DnsProvider};
pub use ssh::{CommandOutput, RemoteSession, SessionFactory, SshSessionFactory};

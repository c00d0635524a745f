//! deploymat
//!
//! 面向单机 VPS 的部署编排库：SSH 远程会话、幂等 DNS 记录调和、
//! 产物传输、docker compose 容器编排，由固定阶段顺序的协调器串联。

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
pub mod state;

pub use error::{DeployError, DeployResult};

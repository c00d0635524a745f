//! 领域模型

pub mod deploy;
pub mod dns;

//! 运行期共享状态

pub mod event_hub;
pub mod run_store;

pub use event_hub::{EventHub, ProgressReporter};
pub use run_store::RunStore;

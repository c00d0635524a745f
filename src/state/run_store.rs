//! 部署运行记录存储
//!
//! 由协调器持有的并发安全键值表：显式插入、显式驱逐，无全局单例。
//! 状态机转移规则在这里集中执行，终态一旦落定不再变化。

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::constants::MAX_RUN_HISTORY;
use crate::domain::deploy::{DeploymentRun, RunPhase, RunStatus};

/// 单个 run 的存储条目
struct RunEntry {
    run: DeploymentRun,
    cancel: CancellationToken,
}

/// 运行记录存储
pub struct RunStore {
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// 登记新 run，返回它的取消令牌
    ///
    /// 超出历史上限时从最旧的终态 run 开始修剪，活跃 run 不受影响
    pub async fn insert(&self, run: DeploymentRun) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut runs = self.runs.write().await;
        runs.insert(
            run.id.clone(),
            RunEntry {
                run,
                cancel: cancel.clone(),
            },
        );

        if runs.len() > MAX_RUN_HISTORY {
            let mut terminal: Vec<_> = runs
                .values()
                .filter(|e| e.run.status.is_terminal())
                .map(|e| (e.run.created_at, e.run.id.clone()))
                .collect();
            terminal.sort();
            for (_, id) in terminal {
                if runs.len() <= MAX_RUN_HISTORY {
                    break;
                }
                runs.remove(&id);
            }
        }
        cancel
    }

    /// 查询 run 快照
    pub async fn get(&self, run_id: &str) -> Option<DeploymentRun> {
        let runs = self.runs.read().await;
        runs.get(run_id).map(|e| e.run.clone())
    }

    /// 所有 run 快照
    pub async fn list(&self) -> Vec<DeploymentRun> {
        let runs = self.runs.read().await;
        runs.values().map(|e| e.run.clone()).collect()
    }

    pub async fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        let runs = self.runs.read().await;
        runs.get(run_id).map(|e| e.cancel.clone())
    }

    /// 推进当前阶段
    pub async fn set_phase(&self, run_id: &str, phase: RunPhase) {
        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(run_id) {
            if !entry.run.status.is_terminal() {
                entry.run.phase = Some(phase);
            }
        }
    }

    /// queued -> running；其他起点一律拒绝
    ///
    /// 返回 false 表示 run 已被别的执行方接管或已进入终态，
    /// 调用方不得再驱动管线
    pub async fn mark_running(&self, run_id: &str) -> bool {
        self.transition(run_id, RunStatus::Queued, RunStatus::Running, None)
            .await
    }

    /// running -> completed
    pub async fn mark_completed(&self, run_id: &str) -> bool {
        self.transition(run_id, RunStatus::Running, RunStatus::Completed, None)
            .await
    }

    /// running -> failed，原样记录触发阶段的错误文本
    pub async fn mark_failed(&self, run_id: &str, error: String) -> bool {
        self.transition(run_id, RunStatus::Running, RunStatus::Failed, Some(error))
            .await
    }

    /// queued|running -> cancelled；触发取消令牌
    ///
    /// 已是终态时返回 false，不做任何修改
    pub async fn cancel(&self, run_id: &str) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(entry) if !entry.run.status.is_terminal() => {
                entry.run.status = RunStatus::Cancelled;
                entry.run.finished_at = Some(Utc::now());
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// 显式驱逐（由外部 API 层触发）
    pub async fn remove(&self, run_id: &str) -> Option<DeploymentRun> {
        let mut runs = self.runs.write().await;
        runs.remove(run_id).map(|e| e.run)
    }

    pub async fn active_count(&self) -> usize {
        let runs = self.runs.read().await;
        runs.values()
            .filter(|e| !e.run.status.is_terminal())
            .count()
    }

    /// 仅当当前状态等于 from 时落下转移（写锁内比较并交换）
    async fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        status: RunStatus,
        error: Option<String>,
    ) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(entry) if entry.run.status == from => {
                entry.run.status = status;
                if status.is_terminal() {
                    entry.run.finished_at = Some(Utc::now());
                    entry.run.error = error;
                }
                true
            }
            _ => false,
        }
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// 车间扫码追溯网关 - 工单上下文追踪器
// ==========================================
// 职责: 维护每条产线的激活工单上下文状态机
// 状态机: Unset → Active → {Suspended ⇄ Active, Completed → Unset}
// 串行化: 同一产线的上下文变更按到达顺序生效;
//         变更进行中的并发请求立即返回 ContextBusy,不排队竞态
// 兜底: 后端不可达时使用本地过期快照激活,上下文标注 unverified
// ==========================================

use crate::backend::{BackendError, ManufacturingBackend};
use crate::domain::types::ContextState;
use crate::domain::validate;
use crate::domain::work_order::{WorkOrderContext, WorkOrderSnapshot};
use crate::engine::validator::ConsumptionLedger;
use crate::repository::error::RepositoryError;
use crate::repository::snapshot_repo::SnapshotRepository;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// 上下文操作错误（操作员可纠正,不会造成数据丢失）
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("工单不存在或后端无法确认: {0}")]
    UnknownWorkOrder(String),

    #[error("工单状态不允许开工: work_order_id={work_order_id}, state={state}")]
    NotActivatable {
        work_order_id: String,
        state: String,
    },

    #[error("产线 {0} 正在进行上下文变更,请稍后重试")]
    ContextBusy(String),

    #[error("无效的上下文状态迁移: from={from} to={to}")]
    InvalidTransition { from: String, to: String },

    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ==========================================
// ContextTracker - 产线上下文追踪器
// ==========================================
pub struct ContextTracker {
    backend: Arc<dyn ManufacturingBackend>,
    snapshots: Arc<SnapshotRepository>,
    ledger: Arc<ConsumptionLedger>,
    /// 产线 → 当前上下文（读路径无锁）
    contexts: DashMap<String, WorkOrderContext>,
    /// 产线 → 变更互斥（try_lock 失败即 ContextBusy）
    change_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// 快照有效期（秒）
    snapshot_ttl_secs: i64,
}

impl ContextTracker {
    pub fn new(
        backend: Arc<dyn ManufacturingBackend>,
        snapshots: Arc<SnapshotRepository>,
        ledger: Arc<ConsumptionLedger>,
        snapshot_ttl_secs: u64,
    ) -> Self {
        Self {
            backend,
            snapshots,
            ledger,
            contexts: DashMap::new(),
            change_guards: DashMap::new(),
            snapshot_ttl_secs: snapshot_ttl_secs as i64,
        }
    }

    fn guard_for(&self, line: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.change_guards
            .entry(line.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 读取产线当前上下文（不阻塞,不受变更互斥影响）
    pub fn current_context(&self, line: &str) -> Option<WorkOrderContext> {
        self.contexts.get(line).map(|entry| entry.clone())
    }

    /// 激活工单上下文
    ///
    /// 校验顺序: 格式 → 工单存在性/远端状态（快照优先,过期则刷新）→ 激活
    /// 后端不可达且存在本地快照时降级激活（verified=false）。
    pub async fn set_context(
        &self,
        line: &str,
        work_order_id: &str,
        operator_id: &str,
    ) -> Result<WorkOrderContext, ContextError> {
        if !validate::is_valid_work_order_id(work_order_id) {
            return Err(ContextError::InvalidInput(format!(
                "工单号格式非法: {}",
                work_order_id
            )));
        }
        if !validate::is_valid_operator_id(operator_id) {
            return Err(ContextError::InvalidInput(format!(
                "操作员ID格式非法: {}",
                operator_id
            )));
        }

        let guard = self.guard_for(line);
        let _held = guard
            .try_lock()
            .map_err(|_| ContextError::ContextBusy(line.to_string()))?;

        let (snapshot, verified) = self.resolve_work_order(work_order_id).await?;
        if !snapshot.remote_state.allows_activation() {
            return Err(ContextError::NotActivatable {
                work_order_id: work_order_id.to_string(),
                state: snapshot.remote_state.to_string(),
            });
        }

        // 用本地 BoM 行（含已消耗计数）填充消耗台账
        let bom = self.snapshots.get_bom(work_order_id)?;
        self.ledger.hydrate(work_order_id, &bom);

        let context = WorkOrderContext::new(work_order_id, operator_id, line, verified);
        self.contexts.insert(line.to_string(), context.clone());

        info!(
            line = %line,
            work_order_id = %work_order_id,
            operator_id = %operator_id,
            verified = verified,
            "工单上下文已激活"
        );
        Ok(context)
    }

    /// 完工: Active → Completed（上下文保留,物料扫码将被拒绝,直至清除）
    pub async fn complete(&self, line: &str) -> Result<WorkOrderContext, ContextError> {
        let guard = self.guard_for(line);
        let _held = guard
            .try_lock()
            .map_err(|_| ContextError::ContextBusy(line.to_string()))?;

        let mut entry = self
            .contexts
            .get_mut(line)
            .ok_or_else(|| ContextError::InvalidTransition {
                from: ContextState::Unset.to_string(),
                to: ContextState::Completed.to_string(),
            })?;
        if entry.state != ContextState::Active {
            return Err(ContextError::InvalidTransition {
                from: entry.state.to_string(),
                to: ContextState::Completed.to_string(),
            });
        }
        entry.state = ContextState::Completed;
        info!(line = %line, work_order_id = %entry.work_order_id, "工单完工");
        Ok(entry.clone())
    }

    /// 暂停: Active → Suspended
    pub async fn suspend(&self, line: &str) -> Result<WorkOrderContext, ContextError> {
        self.transition(line, ContextState::Active, ContextState::Suspended)
            .await
    }

    /// 恢复: Suspended → Active
    pub async fn resume(&self, line: &str) -> Result<WorkOrderContext, ContextError> {
        self.transition(line, ContextState::Suspended, ContextState::Active)
            .await
    }

    /// 清除上下文（任意状态 → Unset）
    pub async fn clear_context(&self, line: &str) -> Result<Option<WorkOrderContext>, ContextError> {
        let guard = self.guard_for(line);
        let _held = guard
            .try_lock()
            .map_err(|_| ContextError::ContextBusy(line.to_string()))?;

        let removed = self.contexts.remove(line).map(|(_, ctx)| ctx);
        if let Some(ctx) = &removed {
            info!(line = %line, work_order_id = %ctx.work_order_id, "工单上下文已清除");
        }
        Ok(removed)
    }

    async fn transition(
        &self,
        line: &str,
        from: ContextState,
        to: ContextState,
    ) -> Result<WorkOrderContext, ContextError> {
        let guard = self.guard_for(line);
        let _held = guard
            .try_lock()
            .map_err(|_| ContextError::ContextBusy(line.to_string()))?;

        let mut entry = self
            .contexts
            .get_mut(line)
            .ok_or_else(|| ContextError::InvalidTransition {
                from: ContextState::Unset.to_string(),
                to: to.to_string(),
            })?;
        if entry.state != from {
            return Err(ContextError::InvalidTransition {
                from: entry.state.to_string(),
                to: to.to_string(),
            });
        }
        entry.state = to;
        info!(line = %line, work_order_id = %entry.work_order_id, state = %to, "上下文状态迁移");
        Ok(entry.clone())
    }

    /// 解析工单: 新鲜快照直接用;过期/缺失则刷新;后端不可达时过期快照兜底
    ///
    /// 返回 (快照, 是否经后端确认)
    async fn resolve_work_order(
        &self,
        work_order_id: &str,
    ) -> Result<(WorkOrderSnapshot, bool), ContextError> {
        let cached = self.snapshots.get_work_order(work_order_id)?;
        if let Some(snapshot) = &cached {
            if !snapshot.is_stale(self.snapshot_ttl_secs) {
                return Ok((snapshot.clone(), true));
            }
        }

        match self.refresh_work_order(work_order_id).await {
            Ok(snapshot) => Ok((snapshot, true)),
            Err(BackendError::NotFound(_)) => {
                Err(ContextError::UnknownWorkOrder(work_order_id.to_string()))
            }
            Err(BackendError::Transient(reason)) | Err(BackendError::Rejected(reason)) => {
                match cached {
                    Some(snapshot) => {
                        warn!(
                            work_order_id = %work_order_id,
                            reason = %reason,
                            fetched_at = %snapshot.fetched_at,
                            "后端不可达,使用过期快照激活（unverified）"
                        );
                        Ok((snapshot, false))
                    }
                    None => Err(ContextError::UnknownWorkOrder(work_order_id.to_string())),
                }
            }
        }
    }

    /// 从后端刷新工单状态与 BoM,写入本地快照
    pub async fn refresh_work_order(
        &self,
        work_order_id: &str,
    ) -> Result<WorkOrderSnapshot, BackendError> {
        let remote_state = self.backend.fetch_work_order_state(work_order_id).await?;
        let bom = self.backend.fetch_bom(work_order_id).await?;

        let snapshot = WorkOrderSnapshot {
            work_order_id: work_order_id.to_string(),
            remote_state,
            product_name: None,
            fetched_at: Utc::now(),
        };
        self.snapshots
            .upsert_work_order(&snapshot)
            .map_err(|e| BackendError::Rejected(format!("快照写入失败: {}", e)))?;
        self.snapshots
            .upsert_bom(work_order_id, &bom)
            .map_err(|e| BackendError::Rejected(format!("BoM 写入失败: {}", e)))?;
        Ok(snapshot)
    }

    /// 定时刷新所有激活上下文的工单快照（后台任务调用）
    pub async fn refresh_active(&self) {
        let work_orders: Vec<String> = self
            .contexts
            .iter()
            .map(|entry| entry.work_order_id.clone())
            .collect();
        for wo in work_orders {
            if let Err(e) = self.refresh_work_order(&wo).await {
                warn!(work_order_id = %wo, error = %e, "工单快照刷新失败");
            }
        }
    }
}

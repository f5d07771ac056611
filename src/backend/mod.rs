// ==========================================
// 车间扫码追溯网关 - 制造后端接口
// ==========================================
// 职责: 定义核心所消费的后端契约（查询/提交）
// 说明: 具体传输实现（XML-RPC/HTTP 等）在核心之外提供
// 约束: submit_outcome 以 event_id 为幂等键,重复提交在后端侧为 no-op
// ==========================================

use crate::domain::outcome::BufferedRecord;
use crate::domain::types::RemoteWorkOrderState;
use crate::domain::work_order::ComponentRequirement;
use async_trait::async_trait;
use thiserror::Error;

/// 后端交互错误
///
/// Transient 驱动连通性状态机 Online → Offline;
/// Rejected 为后端明确拒绝,仍按失败计数重试。
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("后端暂时不可达: {0}")]
    Transient(String),

    #[error("后端拒绝请求: {0}")]
    Rejected(String),

    #[error("工单不存在: {0}")]
    NotFound(String),
}

impl BackendError {
    /// 是否为应转入离线模式的传输类错误
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// 提交确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    /// 后端首次受理该事件
    Accepted,
    /// 后端已见过该幂等键,本次提交为 no-op
    Duplicate,
}

// ==========================================
// ManufacturingBackend - 后端契约
// ==========================================
#[async_trait]
pub trait ManufacturingBackend: Send + Sync {
    /// 查询工单 BoM（物料需求行,不含本地消耗计数）
    async fn fetch_bom(&self, work_order_id: &str) -> BackendResult<Vec<ComponentRequirement>>;

    /// 查询工单远端生命周期状态
    async fn fetch_work_order_state(
        &self,
        work_order_id: &str,
    ) -> BackendResult<RemoteWorkOrderState>;

    /// 提交一条缓冲记录（event_id 为幂等键）
    async fn submit_outcome(&self, record: &BufferedRecord) -> BackendResult<SubmitAck>;

    /// 连通性探测（离线模式下低频调用）
    async fn ping(&self) -> BackendResult<()>;
}

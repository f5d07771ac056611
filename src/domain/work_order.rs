// ==========================================
// 车间扫码追溯网关 - 工单上下文与 BoM 实体
// ==========================================

use crate::domain::types::{ContextState, RemoteWorkOrderState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// WorkOrderContext - 产线工单上下文
// ==========================================
// 每条产线同一时刻至多一个激活上下文
// 仅由上下文类事件（设定/完工/清除）串行变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderContext {
    pub work_order_id: String,
    pub operator_id: String,
    pub work_center_id: String,
    pub state: ContextState,
    pub activated_at: DateTime<Utc>,
    /// false 表示激活时后端不可达,采用了过期快照兜底
    /// 该上下文产生的所有决策都会标注 context_unverified
    pub verified: bool,
}

impl WorkOrderContext {
    pub fn new(
        work_order_id: impl Into<String>,
        operator_id: impl Into<String>,
        work_center_id: impl Into<String>,
        verified: bool,
    ) -> Self {
        Self {
            work_order_id: work_order_id.into(),
            operator_id: operator_id.into(),
            work_center_id: work_center_id.into(),
            state: ContextState::Active,
            activated_at: Utc::now(),
            verified,
        }
    }
}

// ==========================================
// WorkOrderSnapshot - 工单远端状态本地快照
// ==========================================
// 有界间隔刷新;后端不可达时作为 stale-but-available 兜底
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderSnapshot {
    pub work_order_id: String,
    pub remote_state: RemoteWorkOrderState,
    pub product_name: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl WorkOrderSnapshot {
    /// 快照是否已过期（超出刷新间隔）
    pub fn is_stale(&self, ttl_secs: i64) -> bool {
        (Utc::now() - self.fetched_at).num_seconds() >= ttl_secs
    }
}

// ==========================================
// ComponentRequirement - BoM 物料需求行
// ==========================================
// 不变式: 0 <= consumed_quantity <= required_quantity
// consumed_quantity 仅通过校验引擎的原子比较-递增变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequirement {
    pub component_code: String,
    pub required_quantity: u32,
    pub consumed_quantity: u32,
}

impl ComponentRequirement {
    pub fn new(component_code: impl Into<String>, required_quantity: u32) -> Self {
        Self {
            component_code: component_code.into(),
            required_quantity,
            consumed_quantity: 0,
        }
    }

    /// 剩余可消耗数量
    pub fn remaining(&self) -> u32 {
        self.required_quantity.saturating_sub(self.consumed_quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_remaining() {
        let mut req = ComponentRequirement::new("CMP-001", 3);
        assert_eq!(req.remaining(), 3);
        req.consumed_quantity = 3;
        assert_eq!(req.remaining(), 0);
    }

    #[test]
    fn test_snapshot_staleness() {
        let snap = WorkOrderSnapshot {
            work_order_id: "WO1001".to_string(),
            remote_state: RemoteWorkOrderState::Progress,
            product_name: None,
            fetched_at: Utc::now(),
        };
        assert!(!snap.is_stale(300));
        assert!(snap.is_stale(0));
    }
}

// ==========================================
// 车间扫码追溯网关 - 校验结果与缓冲记录实体
// ==========================================
// 不变式: 每个 ScanEvent 恰好产生一个 ValidationOutcome
//         与一个 BufferedRecord (1:1:1)
// ==========================================

use crate::domain::types::{Decision, DeliveryStatus, ScanKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==========================================
// ValidationOutcome - 校验决策结果
// ==========================================
// 一经产生不可变更;拒绝决策同样进入追溯链
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub event_id: Uuid,
    pub device_id: String,
    pub decision: Decision,
    pub scan_kind: ScanKind,
    pub raw_payload: String,
    /// 决策发生时的工单（无上下文拒绝时为 None）
    pub work_order_id: Option<String>,
    pub operator_id: Option<String>,
    /// 物料消耗决策涉及的物料编码
    pub component_code: Option<String>,
    /// 决策后的消耗计数（物料决策时有值）
    pub consumed_quantity: Option<u32>,
    pub required_quantity: Option<u32>,
    /// 上下文激活时后端不可达,基于过期快照作出的决策
    pub context_unverified: bool,
    /// 操作员可读的补充说明（如上下文变更失败原因）
    pub detail: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl ValidationOutcome {
    /// 构造上下文类决策（设定/完工/清除）
    pub fn context_event(
        event_id: Uuid,
        device_id: impl Into<String>,
        scan_kind: ScanKind,
        raw_payload: impl Into<String>,
        decision: Decision,
        work_order_id: Option<String>,
        operator_id: Option<String>,
        context_unverified: bool,
    ) -> Self {
        Self {
            event_id,
            device_id: device_id.into(),
            decision,
            scan_kind,
            raw_payload: raw_payload.into(),
            work_order_id,
            operator_id,
            component_code: None,
            consumed_quantity: None,
            required_quantity: None,
            context_unverified,
            detail: None,
            decided_at: Utc::now(),
        }
    }

    /// 决策的机器可读原因码
    pub fn reason_code(&self) -> &'static str {
        self.decision.reason_code()
    }
}

// ==========================================
// BufferedRecord - 持久化缓冲记录
// ==========================================
// seq 为缓冲区全局单调插入序号,即向后端回放的顺序
// delivery_status / attempt 簿记是仅有的可变字段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub seq: i64,
    pub event_id: Uuid,
    pub device_id: String,
    pub work_order_id: Option<String>,
    pub outcome: ValidationOutcome,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl BufferedRecord {
    /// 是否尚未确认送达后端（追溯查询中的 unsynced 标记）
    pub fn is_unsynced(&self) -> bool {
        self.delivery_status != DeliveryStatus::Delivered
    }
}

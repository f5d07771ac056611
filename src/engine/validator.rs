// ==========================================
// 车间扫码追溯网关 - 物料消耗校验引擎
// ==========================================
// 决策顺序（固定）:
//   1. 无激活上下文        → RejectedWrongContext
//   2. 物料不在工单 BoM 中 → RejectedUnknownComponent
//   3. 消耗数量已达上限    → RejectedQuantityExceeded
//   4. 否则                → Accepted, consumed += qty
// 并发: 比较-递增按 (work_order_id, component_code) 串行,
//       不同物料/不同工单并发互不阻塞
// 不变式: consumed_quantity 永不超过 required_quantity
// ==========================================

use crate::domain::outcome::ValidationOutcome;
use crate::domain::scan_event::ScanEvent;
use crate::domain::types::{ContextState, Decision};
use crate::domain::work_order::{ComponentRequirement, WorkOrderContext};
use crate::repository::error::RepositoryResult;
use crate::repository::snapshot_repo::SnapshotRepository;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

// ==========================================
// ConsumptionLedger - 消耗台账
// ==========================================
// 每个 (工单, 物料) 一个条目;DashMap 分片锁保证条目级原子比较-递增
// 接受扫码时写穿 bom_lines,崩溃重启后计数可恢复
pub struct ConsumptionLedger {
    entries: DashMap<(String, String), ComponentRequirement>,
    snapshots: Arc<SnapshotRepository>,
}

/// 台账消耗尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeResult {
    /// 记账成功,返回更新后的 (已消耗, 需求) 数量
    Consumed { consumed: u32, required: u32 },
    /// 物料不在该工单 BoM 中
    UnknownComponent,
    /// 已达需求上限
    Exceeded { consumed: u32, required: u32 },
}

impl ConsumptionLedger {
    pub fn new(snapshots: Arc<SnapshotRepository>) -> Self {
        Self {
            entries: DashMap::new(),
            snapshots,
        }
    }

    /// 用 BoM 行填充台账（上下文激活时调用）
    ///
    /// 已存在条目保留内存中的消耗计数（不回退）,仅更新需求数量;
    /// 该工单下不在新 BoM 中的条目移除,与持久化行保持一致。
    pub fn hydrate(&self, work_order_id: &str, lines: &[ComponentRequirement]) {
        for line in lines {
            let key = (work_order_id.to_string(), line.component_code.clone());
            self.entries
                .entry(key)
                .and_modify(|existing| {
                    existing.required_quantity = line.required_quantity;
                    existing.consumed_quantity =
                        existing.consumed_quantity.max(line.consumed_quantity);
                })
                .or_insert_with(|| line.clone());
        }
        self.entries.retain(|(wo, code), _| {
            wo != work_order_id || lines.iter().any(|l| l.component_code == *code)
        });
    }

    /// 原子比较-递增
    ///
    /// 条目分片锁内完成判定、递增与写穿持久化;持久化失败回滚内存计数并传播,
    /// 调用方不得认为消耗已记账。
    pub fn try_consume(
        &self,
        work_order_id: &str,
        component_code: &str,
        quantity: u32,
    ) -> RepositoryResult<ConsumeResult> {
        let key = (work_order_id.to_string(), component_code.to_string());
        let mut entry = match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return Ok(ConsumeResult::UnknownComponent),
        };

        if entry.consumed_quantity + quantity > entry.required_quantity {
            return Ok(ConsumeResult::Exceeded {
                consumed: entry.consumed_quantity,
                required: entry.required_quantity,
            });
        }

        let new_consumed = entry.consumed_quantity + quantity;
        if let Err(e) = self
            .snapshots
            .set_consumed(work_order_id, component_code, new_consumed)
        {
            return Err(e);
        }
        entry.consumed_quantity = new_consumed;
        Ok(ConsumeResult::Consumed {
            consumed: new_consumed,
            required: entry.required_quantity,
        })
    }

    /// 读取台账条目（测试/状态查询）
    pub fn get(&self, work_order_id: &str, component_code: &str) -> Option<ComponentRequirement> {
        self.entries
            .get(&(work_order_id.to_string(), component_code.to_string()))
            .map(|e| e.clone())
    }
}

// ==========================================
// ValidationEngine - 校验引擎
// ==========================================
pub struct ValidationEngine {
    ledger: Arc<ConsumptionLedger>,
}

impl ValidationEngine {
    pub fn new(ledger: Arc<ConsumptionLedger>) -> Self {
        Self { ledger }
    }

    /// 校验一次物料扫码,产出决策
    ///
    /// 除台账的比较-递增外为纯函数;每次扫码恒定消耗 1 个单位。
    pub fn validate(
        &self,
        event: &ScanEvent,
        context: Option<&WorkOrderContext>,
    ) -> RepositoryResult<ValidationOutcome> {
        let component_code = event.raw_payload.trim().to_string();

        // 1. 无激活上下文
        let context = match context {
            Some(ctx) if ctx.state == ContextState::Active => ctx,
            _ => {
                debug!(
                    device_id = %event.device_id,
                    payload = %component_code,
                    "无激活工单上下文,拒绝扫码"
                );
                return Ok(self.outcome(
                    event,
                    Decision::RejectedWrongContext,
                    None,
                    Some(component_code),
                    None,
                    false,
                ));
            }
        };

        // 2/3/4. 台账原子判定
        let result = self
            .ledger
            .try_consume(&context.work_order_id, &component_code, 1)?;

        let outcome = match result {
            ConsumeResult::UnknownComponent => self.outcome(
                event,
                Decision::RejectedUnknownComponent,
                Some(context),
                Some(component_code),
                None,
                !context.verified,
            ),
            ConsumeResult::Exceeded { consumed, required } => self.outcome(
                event,
                Decision::RejectedQuantityExceeded,
                Some(context),
                Some(component_code),
                Some((consumed, required)),
                !context.verified,
            ),
            ConsumeResult::Consumed { consumed, required } => self.outcome(
                event,
                Decision::Accepted,
                Some(context),
                Some(component_code),
                Some((consumed, required)),
                !context.verified,
            ),
        };
        Ok(outcome)
    }

    fn outcome(
        &self,
        event: &ScanEvent,
        decision: Decision,
        context: Option<&WorkOrderContext>,
        component_code: Option<String>,
        quantities: Option<(u32, u32)>,
        context_unverified: bool,
    ) -> ValidationOutcome {
        ValidationOutcome {
            event_id: event.event_id,
            device_id: event.device_id.clone(),
            decision,
            scan_kind: event.scan_kind,
            raw_payload: event.raw_payload.clone(),
            work_order_id: context.map(|c| c.work_order_id.clone()),
            operator_id: context.map(|c| c.operator_id.clone()),
            component_code,
            consumed_quantity: quantities.map(|(c, _)| c),
            required_quantity: quantities.map(|(_, r)| r),
            context_unverified,
            detail: None,
            decided_at: Utc::now(),
        }
    }
}

// ==========================================
// 车间扫码追溯网关 - 事件分发器
// ==========================================
// 职责: 所有扫码事件的唯一入口
//   1. 载荷格式校验（非法载荷同样产出决策并入账）
//   2. 分类: 上下文类载荷 → 上下文追踪器;物料载荷 → 校验引擎
//   3. 所有决策（含拒绝）写入持久化缓冲区
// 载荷分类约定（条码/通用扫码适用;RFID 标签恒为物料,
// 因其十六进制编码可能与工单号格式撞形）:
//   - "WO-DONE"  → 完工
//   - "WO-CLEAR" → 清除上下文
//   - 匹配工单号格式（2-4 大写字母 + 3-8 数字）→ 激活上下文
//   - 其余       → 物料扫码
// 持久化失败向调用方传播: 操作员必须看到"扫码未保存,请重试"
// ==========================================

use crate::config::BridgeConfig;
use crate::domain::outcome::ValidationOutcome;
use crate::domain::scan_event::ScanEvent;
use crate::domain::types::{Decision, ScanKind};
use crate::domain::validate;
use crate::engine::context_tracker::{ContextError, ContextTracker};
use crate::engine::validator::ValidationEngine;
use crate::repository::buffer_repo::BufferRepository;
use crate::repository::error::RepositoryError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// 完工载荷
const PAYLOAD_COMPLETE: &str = "WO-DONE";
/// 清除上下文载荷
const PAYLOAD_CLEAR: &str = "WO-CLEAR";

/// 分发错误
///
/// 校验拒绝不是错误（作为决策正常返回);
/// NotSaved 表示事件未能落盘,调用方必须提示操作员重试。
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("扫码未保存,请重试: {0}")]
    NotSaved(#[from] RepositoryError),
}

/// 载荷分类结果
#[derive(Debug, PartialEq, Eq)]
enum PayloadClass {
    SetContext(String),
    Complete,
    Clear,
    Component,
}

fn classify_payload(payload: &str, kind: ScanKind) -> PayloadClass {
    if kind == ScanKind::Rfid {
        return PayloadClass::Component;
    }
    let trimmed = payload.trim();
    if trimmed.eq_ignore_ascii_case(PAYLOAD_COMPLETE) {
        return PayloadClass::Complete;
    }
    if trimmed.eq_ignore_ascii_case(PAYLOAD_CLEAR) {
        return PayloadClass::Clear;
    }
    if validate::is_valid_work_order_id(trimmed) {
        return PayloadClass::SetContext(trimmed.to_string());
    }
    PayloadClass::Component
}

// ==========================================
// EventDispatcher - 事件分发器
// ==========================================
pub struct EventDispatcher {
    tracker: Arc<ContextTracker>,
    validator: Arc<ValidationEngine>,
    buffer: Arc<BufferRepository>,
    config: Arc<BridgeConfig>,
}

impl EventDispatcher {
    pub fn new(
        tracker: Arc<ContextTracker>,
        validator: Arc<ValidationEngine>,
        buffer: Arc<BufferRepository>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            tracker,
            validator,
            buffer,
            config,
        }
    }

    /// 处理一个扫码事件
    ///
    /// 每个事件恰好产出一个决策与一条缓冲记录;
    /// 可被多设备任务并发调用,串行化由追踪器/台账内部锁提供。
    pub async fn handle(&self, event: ScanEvent) -> Result<ValidationOutcome, DispatchError> {
        let line = self.config.line_for_device(&event.device_id).to_string();

        // 上下文动词载荷不做扫码格式校验（如 WO-DONE 不含数字,非合法条码）
        let outcome = {
            match classify_payload(&event.raw_payload, event.scan_kind) {
                PayloadClass::SetContext(work_order_id) => {
                    self.handle_set_context(&event, &line, &work_order_id).await
                }
                PayloadClass::Complete => {
                    match self.tracker.complete(&line).await {
                        Ok(ctx) => ValidationOutcome::context_event(
                            event.event_id,
                            event.device_id.clone(),
                            event.scan_kind,
                            event.raw_payload.clone(),
                            Decision::ContextCompleted,
                            Some(ctx.work_order_id),
                            Some(ctx.operator_id),
                            !ctx.verified,
                        ),
                        Err(e) => self.rejected_context_change(&event, &line, e),
                    }
                }
                PayloadClass::Clear => {
                    match self.tracker.clear_context(&line).await {
                        Ok(cleared) => {
                            let (wo, op) = cleared
                                .map(|c| (Some(c.work_order_id), Some(c.operator_id)))
                                .unwrap_or((None, None));
                            ValidationOutcome::context_event(
                                event.event_id,
                                event.device_id.clone(),
                                event.scan_kind,
                                event.raw_payload.clone(),
                                Decision::ContextCleared,
                                wo,
                                op,
                                false,
                            )
                        }
                        Err(e) => self.rejected_context_change(&event, &line, e),
                    }
                }
                PayloadClass::Component => {
                    if !validate::is_valid_scan_payload(&event.raw_payload, event.scan_kind) {
                        warn!(
                            device_id = %event.device_id,
                            payload = %event.raw_payload,
                            kind = %event.scan_kind,
                            "载荷格式非法"
                        );
                        self.context_outcome(&event, &line, Decision::RejectedMalformedPayload, None)
                    } else {
                        let context = self.tracker.current_context(&line);
                        self.validator.validate(&event, context.as_ref())?
                    }
                }
            }
        };

        // 任何决策都必须落盘后才能返回
        let record = self.buffer.append(&outcome)?;
        info!(
            event_id = %event.event_id,
            device_id = %event.device_id,
            seq = record.seq,
            decision = %outcome.decision,
            "扫码事件已入账"
        );
        Ok(outcome)
    }

    async fn handle_set_context(
        &self,
        event: &ScanEvent,
        line: &str,
        work_order_id: &str,
    ) -> ValidationOutcome {
        // 扫码激活沿用当前操作员,无上下文时记为 unknown（API 激活会显式传入）
        let operator_id = self
            .tracker
            .current_context(line)
            .map(|c| c.operator_id)
            .unwrap_or_else(|| "unknown".to_string());

        match self
            .tracker
            .set_context(line, work_order_id, &operator_id)
            .await
        {
            Ok(ctx) => ValidationOutcome::context_event(
                event.event_id,
                event.device_id.clone(),
                event.scan_kind,
                event.raw_payload.clone(),
                Decision::ContextSet,
                Some(ctx.work_order_id),
                Some(ctx.operator_id),
                !ctx.verified,
            ),
            Err(e) => self.rejected_context_change(event, line, e),
        }
    }

    fn rejected_context_change(
        &self,
        event: &ScanEvent,
        line: &str,
        error: ContextError,
    ) -> ValidationOutcome {
        warn!(
            device_id = %event.device_id,
            line = %line,
            payload = %event.raw_payload,
            error = %error,
            "上下文变更被拒绝"
        );
        self.context_outcome(
            event,
            line,
            Decision::RejectedContextChange,
            Some(error.to_string()),
        )
    }

    /// 以当前上下文信息构造决策（不触发上下文变更）
    fn context_outcome(
        &self,
        event: &ScanEvent,
        line: &str,
        decision: Decision,
        detail: Option<String>,
    ) -> ValidationOutcome {
        let ctx = self.tracker.current_context(line);
        let mut outcome = ValidationOutcome::context_event(
            event.event_id,
            event.device_id.clone(),
            event.scan_kind,
            event.raw_payload.clone(),
            decision,
            ctx.as_ref().map(|c| c.work_order_id.clone()),
            ctx.as_ref().map(|c| c.operator_id.clone()),
            ctx.as_ref().map(|c| !c.verified).unwrap_or(false),
        );
        outcome.detail = detail;
        outcome
    }
}

// ==========================================
// 车间扫码追溯网关 - 核心业务 API
// ==========================================
// 职责: 供外层 CLI/Web 封装的业务接口
//   - POST /api/scan                   → scan
//   - POST /api/work-order/set-context → set_work_order_context
//   - GET  /api/traceability           → traceability
//   - GET  /api/status                 → status
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::domain::outcome::{BufferedRecord, ValidationOutcome};
use crate::domain::scan_event::ScanEvent;
use crate::domain::types::ScanKind;
use crate::domain::validate;
use crate::domain::work_order::WorkOrderContext;
use crate::engine::context_tracker::ContextTracker;
use crate::engine::dispatcher::EventDispatcher;
use crate::repository::buffer_repo::{BufferRepository, BufferStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ==========================================
// 请求/响应 DTO
// ==========================================

/// 扫码请求（外层 Web 接口透传）
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub device_id: String,
    pub scan_data: String,
    /// barcode / rfid,缺省 barcode
    pub scan_type: Option<String>,
    /// 设备内递增序号（Web 提交可缺省,由网关按设备代发）
    pub sequence_number: Option<u64>,
}

// ==========================================
// DeviceSequences - 每设备递增序号
// ==========================================
// API 路径的提交端没有设备端计数器,序号由网关代发,
// 与 SimulatedDevice 的设备内单调语义保持一致
struct DeviceSequences(DashMap<String, u64>);

impl DeviceSequences {
    fn new() -> Self {
        Self(DashMap::new())
    }

    fn next(&self, device_id: &str) -> u64 {
        let mut entry = self.0.entry(device_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// 激活上下文请求
#[derive(Debug, Clone, Deserialize)]
pub struct SetContextRequest {
    pub work_order_id: String,
    /// 缺省 unknown（与原始设备端约定一致）
    pub operator_id: Option<String>,
    /// 缺省使用配置的默认工位
    pub line_id: Option<String>,
}

/// 追溯查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceabilityQuery {
    pub work_order_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// 追溯查询结果行
#[derive(Debug, Clone, Serialize)]
pub struct TraceabilityRow {
    pub seq: i64,
    pub event_id: String,
    pub device_id: String,
    pub work_order_id: Option<String>,
    pub component_code: Option<String>,
    pub reason_code: String,
    pub consumed_quantity: Option<u32>,
    pub required_quantity: Option<u32>,
    pub context_unverified: bool,
    pub created_at: DateTime<Utc>,
    pub delivery_status: String,
    pub attempt_count: u32,
    /// 尚未确认送达后端（含死信）
    pub unsynced: bool,
    /// 重试耗尽,等待人工对账
    pub dead_letter: bool,
}

impl From<&BufferedRecord> for TraceabilityRow {
    fn from(record: &BufferedRecord) -> Self {
        Self {
            seq: record.seq,
            event_id: record.event_id.to_string(),
            device_id: record.device_id.clone(),
            work_order_id: record.work_order_id.clone(),
            component_code: record.outcome.component_code.clone(),
            reason_code: record.outcome.reason_code().to_string(),
            consumed_quantity: record.outcome.consumed_quantity,
            required_quantity: record.outcome.required_quantity,
            context_unverified: record.outcome.context_unverified,
            created_at: record.created_at,
            delivery_status: record.delivery_status.to_string(),
            attempt_count: record.attempt_count,
            unsynced: record.is_unsynced(),
            dead_letter: record.delivery_status
                == crate::domain::types::DeliveryStatus::DeadLetter,
        }
    }
}

/// 网关状态响应
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub backend_online: bool,
    pub buffer: BufferStats,
}

// ==========================================
// ScanApi - 核心业务 API
// ==========================================
pub struct ScanApi {
    dispatcher: Arc<EventDispatcher>,
    tracker: Arc<ContextTracker>,
    buffer: Arc<BufferRepository>,
    default_line: String,
    backend_online: Arc<AtomicBool>,
    sequences: DeviceSequences,
}

impl ScanApi {
    pub fn new(
        dispatcher: Arc<EventDispatcher>,
        tracker: Arc<ContextTracker>,
        buffer: Arc<BufferRepository>,
        default_line: String,
        backend_online: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dispatcher,
            tracker,
            buffer,
            default_line,
            backend_online,
            sequences: DeviceSequences::new(),
        }
    }

    /// 处理一次扫码提交
    ///
    /// 返回的决策可能是拒绝（正常结果);
    /// 仅当事件无法落盘时返回 NotSaved 错误。
    pub async fn scan(&self, request: ScanRequest) -> ApiResult<ValidationOutcome> {
        if !validate::is_valid_device_id(&request.device_id) {
            return Err(ApiError::InvalidInput(format!(
                "设备ID格式非法: {}",
                request.device_id
            )));
        }
        if request.scan_data.trim().is_empty() {
            return Err(ApiError::InvalidInput("scan_data 不能为空".to_string()));
        }

        let kind = ScanKind::parse(request.scan_type.as_deref().unwrap_or("barcode"));
        let sequence_number = request
            .sequence_number
            .unwrap_or_else(|| self.sequences.next(&request.device_id));
        let event = ScanEvent::new(request.device_id, request.scan_data, kind, sequence_number);
        Ok(self.dispatcher.handle(event).await?)
    }

    /// 激活工单上下文（显式 API 路径,区别于扫码激活）
    pub async fn set_work_order_context(
        &self,
        request: SetContextRequest,
    ) -> ApiResult<WorkOrderContext> {
        let line = request.line_id.as_deref().unwrap_or(&self.default_line);
        let operator = request.operator_id.as_deref().unwrap_or("unknown");
        Ok(self
            .tracker
            .set_context(line, &request.work_order_id, operator)
            .await?)
    }

    /// 清除工单上下文
    pub async fn clear_work_order_context(
        &self,
        line_id: Option<&str>,
    ) -> ApiResult<Option<WorkOrderContext>> {
        let line = line_id.unwrap_or(&self.default_line);
        Ok(self.tracker.clear_context(line).await?)
    }

    /// 读取产线当前上下文
    pub fn current_context(&self, line_id: Option<&str>) -> Option<WorkOrderContext> {
        let line = line_id.unwrap_or(&self.default_line);
        self.tracker.current_context(line)
    }

    /// 追溯查询: seq 升序返回记录,未同步/死信记录带显式标记
    pub fn traceability(&self, query: TraceabilityQuery) -> ApiResult<Vec<TraceabilityRow>> {
        let records = self.buffer.query_records(
            query.work_order_id.as_deref(),
            query.start_date,
            query.end_date,
        )?;
        Ok(records.iter().map(TraceabilityRow::from).collect())
    }

    /// 网关状态（连通性 + 缓冲区统计）
    pub fn status(&self) -> ApiResult<StatusResponse> {
        Ok(StatusResponse {
            backend_online: self.backend_online.load(Ordering::Relaxed),
            buffer: self.buffer.stats()?,
        })
    }
}

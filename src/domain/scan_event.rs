// ==========================================
// 车间扫码追溯网关 - 扫码事件实体
// ==========================================
// 红线: ScanEvent 一经创建不可变更
// ==========================================

use crate::domain::types::ScanKind;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// 进程启动时刻，用于单调时间戳
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// 距进程启动的单调毫秒数（不受系统时钟回拨影响）
pub fn monotonic_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

// ==========================================
// ScanEvent - 规范化扫码事件
// ==========================================
// 由设备适配器创建,核心只依赖这份规范化结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEvent {
    /// 全局唯一事件ID（同时作为后端幂等键）
    pub event_id: Uuid,
    /// 采集设备ID
    pub device_id: String,
    /// 原始扫码载荷
    pub raw_payload: String,
    /// 扫码类型
    pub scan_kind: ScanKind,
    /// 墙钟时间戳
    pub captured_at_wall: DateTime<Utc>,
    /// 单调时间戳（毫秒,距进程启动）
    pub captured_at_mono_ms: u64,
    /// 设备内单调递增序号
    pub sequence_number: u64,
}

impl ScanEvent {
    /// 创建新事件（适配器/API 入口使用,时间戳取当前时刻）
    pub fn new(
        device_id: impl Into<String>,
        raw_payload: impl Into<String>,
        scan_kind: ScanKind,
        sequence_number: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            device_id: device_id.into(),
            raw_payload: raw_payload.into(),
            scan_kind,
            captured_at_wall: Utc::now(),
            captured_at_mono_ms: monotonic_ms(),
            sequence_number,
        }
    }
}

// ==========================================
// 车间扫码追溯网关 - 载荷格式校验
// ==========================================
// 职责: 扫码载荷/工单号/操作员/设备ID 的格式检查
// 格式非法的扫码产生 RejectedMalformedPayload,仍进入追溯链
// ==========================================

use once_cell::sync::Lazy;
use regex::Regex;

/// 工单号格式: 2-4 位大写字母前缀 + 3-8 位数字（如 WO001 / MO20240115）
static WORK_ORDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,4}[0-9]{3,8}$").expect("invalid work order regex"));

/// RFID 标签: 8-32 位十六进制
static RFID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{8,32}$").expect("invalid rfid regex"));

/// 物料编码: 字母数字与常见分隔符
static COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-\._]{3,50}$").expect("invalid component regex"));

/// 操作员ID: 字母数字/短横线/下划线
static OPERATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_]{2,20}$").expect("invalid operator regex"));

/// 设备ID: 字母数字/短横线/下划线
static DEVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_]{1,64}$").expect("invalid device regex"));

/// 校验工单号格式
pub fn is_valid_work_order_id(id: &str) -> bool {
    WORK_ORDER_RE.is_match(id)
}

/// 校验条码格式: 3-50 位,须含数字
pub fn is_valid_barcode(payload: &str) -> bool {
    let cleaned: String = payload
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();
    (3..=50).contains(&cleaned.len()) && cleaned.chars().any(|c| c.is_ascii_digit())
}

/// 校验 RFID 标签格式
pub fn is_valid_rfid(payload: &str) -> bool {
    RFID_RE.is_match(payload)
}

/// 校验物料编码格式
pub fn is_valid_component_code(code: &str) -> bool {
    COMPONENT_RE.is_match(code)
}

/// 校验操作员ID格式
pub fn is_valid_operator_id(id: &str) -> bool {
    OPERATOR_RE.is_match(id)
}

/// 校验设备ID格式
pub fn is_valid_device_id(id: &str) -> bool {
    DEVICE_RE.is_match(id)
}

/// 按扫码类型校验载荷
pub fn is_valid_scan_payload(payload: &str, kind: crate::domain::types::ScanKind) -> bool {
    use crate::domain::types::ScanKind;
    let payload = payload.trim();
    if payload.is_empty() {
        return false;
    }
    match kind {
        ScanKind::Barcode => is_valid_barcode(payload),
        ScanKind::Rfid => is_valid_rfid(payload),
        ScanKind::Generic => (3..=50).contains(&payload.len()),
    }
}

// ==========================================
// 车间扫码追溯网关 - 领域类型定义
// ==========================================
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 扫码类型 (Scan Kind)
// ==========================================
// 设备能力集: 条码 / RFID / 通用
// 红线: 不按设备类继承建模,在分发器边界按类型分支
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanKind {
    Barcode,
    Rfid,
    Generic,
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanKind::Barcode => write!(f, "BARCODE"),
            ScanKind::Rfid => write!(f, "RFID"),
            ScanKind::Generic => write!(f, "GENERIC"),
        }
    }
}

impl ScanKind {
    /// 从请求字符串解析（大小写不敏感，未知值归入 Generic）
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "barcode" => ScanKind::Barcode,
            "rfid" => ScanKind::Rfid,
            _ => ScanKind::Generic,
        }
    }
}

// ==========================================
// 校验决策 (Validation Decision)
// ==========================================
// 拒绝也是合规追溯的一部分,所有决策都会落入缓冲区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Accepted,                 // 物料消耗已记账
    ContextSet,               // 工单上下文已激活
    ContextCompleted,         // 工单完工
    ContextCleared,           // 上下文清除
    RejectedUnknownComponent, // 物料不在工单 BoM 中
    RejectedWrongContext,     // 无有效工单上下文
    RejectedQuantityExceeded, // 已消耗数量达到需求上限
    RejectedMalformedPayload, // 载荷格式非法
    RejectedContextChange,    // 上下文变更失败 (工单不存在/状态不允许/变更冲突)
}

impl Decision {
    /// 机器可读的原因码（操作员界面/追溯查询使用）
    pub fn reason_code(&self) -> &'static str {
        match self {
            Decision::Accepted => "ACCEPTED",
            Decision::ContextSet => "CONTEXT_SET",
            Decision::ContextCompleted => "CONTEXT_COMPLETED",
            Decision::ContextCleared => "CONTEXT_CLEARED",
            Decision::RejectedUnknownComponent => "REJECTED_UNKNOWN_COMPONENT",
            Decision::RejectedWrongContext => "REJECTED_WRONG_CONTEXT",
            Decision::RejectedQuantityExceeded => "REJECTED_QUANTITY_EXCEEDED",
            Decision::RejectedMalformedPayload => "REJECTED_MALFORMED_PAYLOAD",
            Decision::RejectedContextChange => "REJECTED_CONTEXT_CHANGE",
        }
    }

    /// 是否为接受类决策（物料消耗或上下文变更成功）
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Decision::Accepted
                | Decision::ContextSet
                | Decision::ContextCompleted
                | Decision::ContextCleared
        )
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason_code())
    }
}

// ==========================================
// 投递状态 (Delivery Status)
// ==========================================
// 状态迁移: PENDING → IN_FLIGHT → DELIVERED
//                        ↓ (传输失败)
//                      FAILED → IN_FLIGHT (退避后重试)
//                        ↓ (达到最大重试次数)
//                      DEAD_LETTER (人工对账)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
    DeadLetter,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::InFlight => "IN_FLIGHT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// 从数据库文本解析
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "IN_FLIGHT" => Some(DeliveryStatus::InFlight),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "FAILED" => Some(DeliveryStatus::Failed),
            "DEAD_LETTER" => Some(DeliveryStatus::DeadLetter),
            _ => None,
        }
    }

    /// 是否已脱离同步队列（不再阻塞同设备后续记录）
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::DeadLetter)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 工单上下文状态 (Context State)
// ==========================================
// 状态机: Unset → Active → {Suspended ⇄ Active, Completed → Unset}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    Unset,
    Active,
    Suspended,
    Completed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Unset => write!(f, "UNSET"),
            ContextState::Active => write!(f, "ACTIVE"),
            ContextState::Suspended => write!(f, "SUSPENDED"),
            ContextState::Completed => write!(f, "COMPLETED"),
        }
    }
}

// ==========================================
// 工单远端状态 (Remote Work Order State)
// ==========================================
// 来自制造后端的工单生命周期状态
// 允许激活上下文的状态: Confirmed / Progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteWorkOrderState {
    Draft,
    Confirmed,
    Progress,
    ToClose,
    Done,
    Cancel,
}

impl RemoteWorkOrderState {
    /// 该状态下是否允许激活生产上下文
    pub fn allows_activation(&self) -> bool {
        matches!(
            self,
            RemoteWorkOrderState::Confirmed | RemoteWorkOrderState::Progress
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteWorkOrderState::Draft => "DRAFT",
            RemoteWorkOrderState::Confirmed => "CONFIRMED",
            RemoteWorkOrderState::Progress => "PROGRESS",
            RemoteWorkOrderState::ToClose => "TO_CLOSE",
            RemoteWorkOrderState::Done => "DONE",
            RemoteWorkOrderState::Cancel => "CANCEL",
        }
    }

    /// 从数据库文本解析
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(RemoteWorkOrderState::Draft),
            "CONFIRMED" => Some(RemoteWorkOrderState::Confirmed),
            "PROGRESS" => Some(RemoteWorkOrderState::Progress),
            "TO_CLOSE" => Some(RemoteWorkOrderState::ToClose),
            "DONE" => Some(RemoteWorkOrderState::Done),
            "CANCEL" => Some(RemoteWorkOrderState::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteWorkOrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 车间扫码追溯网关 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型、格式校验
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod outcome;
pub mod scan_event;
pub mod types;
pub mod validate;
pub mod work_order;

// 重导出核心类型
pub use outcome::{BufferedRecord, ValidationOutcome};
pub use scan_event::{monotonic_ms, ScanEvent};
pub use types::{ContextState, Decision, DeliveryStatus, RemoteWorkOrderState, ScanKind};
pub use work_order::{ComponentRequirement, WorkOrderContext, WorkOrderSnapshot};

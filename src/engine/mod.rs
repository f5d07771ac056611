// ==========================================
// 车间扫码追溯网关 - 引擎层
// ==========================================
// 职责: 业务规则（上下文状态机/消耗校验/同步/分发）
// 红线: 引擎不直接拼 SQL,数据访问经由仓储层
// ==========================================

pub mod context_tracker;
pub mod dispatcher;
pub mod sync;
pub mod validator;

// 重导出核心引擎
pub use context_tracker::{ContextError, ContextTracker};
pub use dispatcher::{DispatchError, EventDispatcher};
pub use sync::{Connectivity, SyncEngine};
pub use validator::{ConsumeResult, ConsumptionLedger, ValidationEngine};

// ==========================================
// 车间扫码追溯网关 - 核心库
// ==========================================
// 技术栈: Rust + Tokio + SQLite
// 系统定位: 扫码事件接入/校验/持久化缓冲/同步核心
// 架构: 设备适配器 → 事件分发器 → 上下文追踪/消耗校验
//       → 持久化缓冲区 → 同步引擎 → 制造后端
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 设备适配器接口
pub mod adapter;

// 制造后端接口
pub mod backend;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 状态组装与生命周期
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{ContextState, Decision, DeliveryStatus, RemoteWorkOrderState, ScanKind};

// 领域实体
pub use domain::{
    BufferedRecord, ComponentRequirement, ScanEvent, ValidationOutcome, WorkOrderContext,
    WorkOrderSnapshot,
};

// 引擎
pub use engine::{
    ConsumptionLedger, ContextError, ContextTracker, DispatchError, EventDispatcher, SyncEngine,
    ValidationEngine,
};

// 适配器与后端契约
pub use adapter::{DeviceAdapter, SimulatedDevice};
pub use backend::{BackendError, ManufacturingBackend, SubmitAck};

// API
pub use api::{ApiError, ScanApi, ScanRequest, SetContextRequest, TraceabilityQuery};

// 应用
pub use app::AppState;

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "车间扫码追溯网关";

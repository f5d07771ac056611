// ==========================================
// 车间扫码追溯网关 - API 层
// ==========================================
// 职责: 提供业务 API 接口,供外层 CLI/Web 封装调用
// ==========================================

pub mod error;
pub mod scan_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use scan_api::{
    ScanApi, ScanRequest, SetContextRequest, StatusResponse, TraceabilityQuery, TraceabilityRow,
};

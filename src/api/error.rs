// ==========================================
// 车间扫码追溯网关 - API层错误类型
// ==========================================
// 职责: 转换内层错误为操作员可读的错误消息
// 约束: 校验拒绝不是错误,以决策形式正常返回;
//       此处只承载输入错误/上下文错误/持久化失败
// ==========================================

use crate::engine::context_tracker::ContextError;
use crate::engine::dispatcher::DispatchError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("扫码未保存,请重试: {0}")]
    NotSaved(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl ApiError {
    /// 机器可读错误码（外层 CLI/Web 映射 HTTP 状态用）
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::NotSaved(_) => "NOT_SAVED",
            ApiError::Context(ContextError::ContextBusy(_)) => "CONTEXT_BUSY",
            ApiError::Context(ContextError::UnknownWorkOrder(_)) => "UNKNOWN_WORK_ORDER",
            ApiError::Context(ContextError::NotActivatable { .. }) => "WORK_ORDER_NOT_ACTIVATABLE",
            ApiError::Context(ContextError::InvalidTransition { .. }) => "INVALID_TRANSITION",
            ApiError::Context(_) => "CONTEXT_ERROR",
            ApiError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotSaved(e) => ApiError::NotSaved(e.to_string()),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{} {}", entity, id))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

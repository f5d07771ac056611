// ==========================================
// 车间扫码追溯网关 - 数据仓储层
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 红线: Repository 不含业务逻辑
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod buffer_repo;
pub mod error;
pub mod snapshot_repo;

// 重导出核心仓储
pub use buffer_repo::{BufferRepository, BufferStats};
pub use error::{RepositoryError, RepositoryResult};
pub use snapshot_repo::SnapshotRepository;

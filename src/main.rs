// ==========================================
// 车间扫码追溯网关 - 进程入口
// ==========================================
// 技术栈: Rust + Tokio + SQLite
// 说明: 真实部署中设备驱动与后端客户端在核心之外注入;
//       本入口以离线后端启动,演示接入/缓冲/优雅关停链路
// ==========================================

use iot_scan_bridge::app::{get_default_db_path, AppState};
use iot_scan_bridge::backend::{
    BackendError, BackendResult, ManufacturingBackend, SubmitAck,
};
use iot_scan_bridge::domain::types::RemoteWorkOrderState;
use iot_scan_bridge::domain::work_order::ComponentRequirement;
use iot_scan_bridge::domain::BufferedRecord;
use iot_scan_bridge::logging;
use async_trait::async_trait;
use std::sync::Arc;

/// 离线后端: 所有请求返回传输失败
///
/// 网关在该模式下纯离线运行,事件全部进入持久化缓冲区,
/// 待接入真实后端客户端后回放。
struct OfflineBackend;

#[async_trait]
impl ManufacturingBackend for OfflineBackend {
    async fn fetch_bom(&self, _work_order_id: &str) -> BackendResult<Vec<ComponentRequirement>> {
        Err(BackendError::Transient("离线模式".to_string()))
    }

    async fn fetch_work_order_state(
        &self,
        _work_order_id: &str,
    ) -> BackendResult<RemoteWorkOrderState> {
        Err(BackendError::Transient("离线模式".to_string()))
    }

    async fn submit_outcome(&self, _record: &BufferedRecord) -> BackendResult<SubmitAck> {
        Err(BackendError::Transient("离线模式".to_string()))
    }

    async fn ping(&self) -> BackendResult<()> {
        Err(BackendError::Transient("离线模式".to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{}", iot_scan_bridge::APP_NAME);
    tracing::info!("系统版本: {}", iot_scan_bridge::VERSION);
    tracing::info!("==================================================");

    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(get_default_db_path);
    tracing::info!("使用数据库: {}", db_path);

    let app_state = AppState::new(&db_path, Arc::new(OfflineBackend))?;
    app_state.start_background().await;

    tracing::info!("网关已启动,等待关停信号 (Ctrl-C)");
    tokio::signal::ctrl_c().await?;

    app_state.shutdown().await;
    Ok(())
}

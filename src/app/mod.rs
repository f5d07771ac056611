// ==========================================
// 车间扫码追溯网关 - 应用层
// ==========================================
// 职责: 应用状态组装与进程级路径约定
// ==========================================

pub mod state;

pub use state::AppState;

/// 默认数据库路径
///
/// 优先级: 环境变量 IOT_SCAN_BRIDGE_DB > 工作目录 data/iot_scan_bridge.db
pub fn get_default_db_path() -> String {
    std::env::var("IOT_SCAN_BRIDGE_DB").unwrap_or_else(|_| {
        let dir = std::path::Path::new("data");
        if !dir.exists() {
            let _ = std::fs::create_dir_all(dir);
        }
        "data/iot_scan_bridge.db".to_string()
    })
}

// ==========================================
// 车间扫码追溯网关 - 配置层
// ==========================================
// 职责: 运行时配置的默认值与 config_kv 覆写加载
// 存储: config_kv 表 (key-value + scope, JSON 值)
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ==========================================
// 同步引擎配置
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 单批最大记录数
    pub batch_size: usize,
    /// 在线模式下的排空轮询间隔（毫秒）
    pub drain_interval_ms: u64,
    /// 离线模式下的探测间隔（毫秒）
    pub probe_interval_ms: u64,
    /// 退避基数（毫秒）: 第 n 次失败后等待 base * 2^(n-1),带抖动
    pub retry_base_ms: u64,
    /// 退避上限（毫秒）
    pub retry_max_ms: u64,
    /// 最大重试次数,超出后移入死信
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            drain_interval_ms: 1_000,
            probe_interval_ms: 5_000,
            retry_base_ms: 500,
            retry_max_ms: 60_000,
            max_attempts: 5,
        }
    }
}

// ==========================================
// 缓冲区配置
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// 已送达记录的保留窗口（秒）
    pub retention_secs: u64,
    /// 压缩任务执行间隔（秒）
    pub compact_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 3600,
            compact_interval_secs: 3600,
        }
    }
}

// ==========================================
// 网关总配置
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub sync: SyncConfig,
    pub buffer: BufferConfig,
    /// 工单快照的有效期（秒）,超出后优先从后端刷新
    pub snapshot_ttl_secs: u64,
    /// 设备到工位（产线）的映射
    pub device_lines: HashMap<String, String>,
    /// 未映射设备的默认工位
    pub default_line: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            buffer: BufferConfig::default(),
            snapshot_ttl_secs: 300,
            device_lines: HashMap::new(),
            default_line: "WC-01".to_string(),
        }
    }
}

impl BridgeConfig {
    /// 解析设备所属工位
    pub fn line_for_device(&self, device_id: &str) -> &str {
        self.device_lines
            .get(device_id)
            .map(|s| s.as_str())
            .unwrap_or(&self.default_line)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.buffer.retention_secs as i64)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.compact_interval_secs)
    }
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入 global scope 配置（JSON 文本）
    pub fn set_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// 加载网关配置: 默认值 + config_kv 覆写
    ///
    /// 覆写键:
    /// - bridge.sync    → SyncConfig (JSON)
    /// - bridge.buffer  → BufferConfig (JSON)
    /// - bridge.general → {snapshot_ttl_secs, device_lines, default_line} (JSON)
    pub fn load_bridge_config(&self) -> RepositoryResult<BridgeConfig> {
        let mut config = BridgeConfig::default();

        if let Some(raw) = self.get_config_value("bridge.sync")? {
            config.sync = serde_json::from_str(&raw)
                .map_err(|e| RepositoryError::InternalError(format!("bridge.sync 解析失败: {}", e)))?;
        }
        if let Some(raw) = self.get_config_value("bridge.buffer")? {
            config.buffer = serde_json::from_str(&raw).map_err(|e| {
                RepositoryError::InternalError(format!("bridge.buffer 解析失败: {}", e))
            })?;
        }
        if let Some(raw) = self.get_config_value("bridge.general")? {
            #[derive(Deserialize)]
            struct General {
                snapshot_ttl_secs: Option<u64>,
                device_lines: Option<HashMap<String, String>>,
                default_line: Option<String>,
            }
            let general: General = serde_json::from_str(&raw).map_err(|e| {
                RepositoryError::InternalError(format!("bridge.general 解析失败: {}", e))
            })?;
            if let Some(ttl) = general.snapshot_ttl_secs {
                config.snapshot_ttl_secs = ttl;
            }
            if let Some(lines) = general.device_lines {
                config.device_lines = lines;
            }
            if let Some(line) = general.default_line {
                config.default_line = line;
            }
        }

        Ok(config)
    }
}

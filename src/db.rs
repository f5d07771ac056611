// ==========================================
// 车间扫码追溯网关 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为，避免"部分模块外键开启/部分不开启"
// - 统一 busy_timeout，减少并发写入时的偶发 busy 错误
// - 缓冲区写入要求 WAL + synchronous=FULL：append 返回成功即意味着掉电可恢复
// ==========================================

use rusqlite::Connection;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要"每个连接"单独开启
/// - busy_timeout 需要"每个连接"单独配置
/// - journal_mode=WAL + synchronous=FULL 保证缓冲区 append 提交后落盘
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;",
    )?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 初始化数据库表结构（幂等）
///
/// 表说明：
/// - buffer_records: 持久化缓冲区，seq 为全局单调插入序号（回放顺序）
/// - work_order_snapshots: 工单远端状态本地快照（离线兜底）
/// - bom_lines: 工单 BoM 行与已消耗数量（崩溃重启后恢复计数）
/// - config_kv: 运行时配置覆写
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS buffer_records (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id        TEXT NOT NULL UNIQUE,
            device_id       TEXT NOT NULL,
            work_order_id   TEXT,
            outcome_json    TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            delivery_status TEXT NOT NULL DEFAULT 'PENDING',
            attempt_count   INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            last_error      TEXT,
            delivered_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_buffer_status_seq
            ON buffer_records(delivery_status, seq);
        CREATE INDEX IF NOT EXISTS idx_buffer_device_seq
            ON buffer_records(device_id, seq);
        CREATE INDEX IF NOT EXISTS idx_buffer_wo_created
            ON buffer_records(work_order_id, created_at);

        CREATE TABLE IF NOT EXISTS work_order_snapshots (
            work_order_id TEXT PRIMARY KEY,
            remote_state  TEXT NOT NULL,
            product_name  TEXT,
            fetched_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bom_lines (
            work_order_id  TEXT NOT NULL,
            component_code TEXT NOT NULL,
            required_qty   INTEGER NOT NULL,
            consumed_qty   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (work_order_id, component_code)
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key      TEXT NOT NULL,
            value    TEXT NOT NULL,
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let existing: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    if existing.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [CURRENT_SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

/// 打开连接并保证表结构就绪（应用启动入口使用）
pub fn open_and_init(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = open_sqlite_connection(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

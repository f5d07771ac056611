// ==========================================
// 车间扫码追溯网关 - 持久化缓冲区仓储
// ==========================================
// 红线: Repository 不做业务逻辑,只做数据映射
// 核心保证: append 返回成功 == 记录已落盘（WAL + synchronous=FULL）
// 顺序保证: seq 为 SQLite AUTOINCREMENT,全局单调,重启后不回绕
// 回放按 seq 升序;同设备记录永不越序
// ==========================================

use crate::domain::outcome::{BufferedRecord, ValidationOutcome};
use crate::domain::types::DeliveryStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// 缓冲区状态统计（/api/status 暴露）
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BufferStats {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub delivered: u64,
}

// ==========================================
// BufferRepository - 持久化缓冲区
// ==========================================
pub struct BufferRepository {
    conn: Arc<Mutex<Connection>>,
}

impl BufferRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 写入操作
    // ==========================================

    /// 追加一条校验结果到缓冲区
    ///
    /// 返回成功即表示记录已持久化（进程崩溃/掉电后可恢复）。
    /// 持久化失败向调用方传播,调度器必须提示操作员"扫码未保存,请重试"。
    pub fn append(&self, outcome: &ValidationOutcome) -> RepositoryResult<BufferedRecord> {
        let conn = self.get_conn()?;
        let created_at = Utc::now();
        let outcome_json = serde_json::to_string(outcome)
            .map_err(|e| RepositoryError::InternalError(format!("结果序列化失败: {}", e)))?;

        conn.execute(
            r#"
            INSERT INTO buffer_records (
                event_id, device_id, work_order_id, outcome_json,
                created_at, delivery_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING')
            "#,
            params![
                outcome.event_id.to_string(),
                outcome.device_id,
                outcome.work_order_id,
                outcome_json,
                created_at,
            ],
        )?;

        let seq = conn.last_insert_rowid();
        Ok(BufferedRecord {
            seq,
            event_id: outcome.event_id,
            device_id: outcome.device_id.clone(),
            work_order_id: outcome.work_order_id.clone(),
            outcome: outcome.clone(),
            created_at,
            delivery_status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            delivered_at: None,
        })
    }

    /// 按投递状态迁移规则更新状态,返回迁移前状态
    fn transition(
        &self,
        event_id: &Uuid,
        allowed_from: &[DeliveryStatus],
        set_clause: &str,
        extra: &[&dyn rusqlite::ToSql],
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let id = event_id.to_string();

        let current: String = conn
            .query_row(
                "SELECT delivery_status FROM buffer_records WHERE event_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|_| RepositoryError::NotFound {
                entity: "BufferedRecord".to_string(),
                id: id.clone(),
            })?;

        let current_status = DeliveryStatus::from_db(&current).ok_or_else(|| {
            RepositoryError::InternalError(format!("未知投递状态: {}", current))
        })?;
        if !allowed_from.contains(&current_status) {
            return Err(RepositoryError::InvalidStatusTransition {
                event_id: id,
                from: current,
                to: set_clause.to_string(),
            });
        }

        let sql = format!(
            "UPDATE buffer_records SET {} WHERE event_id = ?1",
            set_clause
        );
        let mut all_params: Vec<&dyn rusqlite::ToSql> = vec![&id];
        all_params.extend_from_slice(extra);
        conn.execute(&sql, all_params.as_slice())?;
        Ok(())
    }

    /// 标记为投递中
    pub fn mark_in_flight(&self, event_id: &Uuid) -> RepositoryResult<()> {
        let now = Utc::now();
        self.transition(
            event_id,
            &[DeliveryStatus::Pending, DeliveryStatus::Failed],
            "delivery_status = 'IN_FLIGHT', last_attempt_at = ?2",
            &[&now],
        )
    }

    /// 标记为已送达（后端已确认,记录进入可压缩状态）
    pub fn mark_delivered(&self, event_id: &Uuid) -> RepositoryResult<()> {
        let now = Utc::now();
        self.transition(
            event_id,
            &[DeliveryStatus::InFlight],
            "delivery_status = 'DELIVERED', delivered_at = ?2, last_error = NULL",
            &[&now],
        )
    }

    /// 标记为投递失败,递增尝试计数
    pub fn mark_failed(&self, event_id: &Uuid, error: &str) -> RepositoryResult<()> {
        let now = Utc::now();
        self.transition(
            event_id,
            &[DeliveryStatus::InFlight],
            "delivery_status = 'FAILED', attempt_count = attempt_count + 1, \
             last_attempt_at = ?2, last_error = ?3",
            &[&now, &error],
        )
    }

    /// 移入死信（达到最大重试次数,等待人工对账,不再阻塞同设备后续记录）
    pub fn mark_dead_letter(&self, event_id: &Uuid) -> RepositoryResult<()> {
        self.transition(
            event_id,
            &[DeliveryStatus::Failed],
            "delivery_status = 'DEAD_LETTER'",
            &[],
        )
    }

    /// 启动恢复: 进程崩溃遗留的 IN_FLIGHT 记录回退为 FAILED
    ///
    /// 投递结果未知,按一次失败尝试计入;幂等键保证即使后端已收到也不会重复生效。
    pub fn reset_in_flight(&self) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let rows = conn.execute(
            "UPDATE buffer_records
             SET delivery_status = 'FAILED',
                 attempt_count = attempt_count + 1,
                 last_error = '进程重启时投递状态未知'
             WHERE delivery_status = 'IN_FLIGHT'",
            [],
        )?;
        Ok(rows)
    }

    // ==========================================
    // 读取操作
    // ==========================================

    /// 按 seq 升序取待同步记录（PENDING / FAILED）
    ///
    /// `exclude_devices` 过滤已判定阻塞的设备,避免单设备深积压
    /// 占满检索窗口后饿死其他设备;同设备队头阻塞与退避资格
    /// 仍由同步引擎判定。
    pub fn peek_batch(
        &self,
        max_n: usize,
        exclude_devices: &[String],
    ) -> RepositoryResult<Vec<BufferedRecord>> {
        let conn = self.get_conn()?;
        let mut sql = String::from(
            "SELECT seq, event_id, device_id, work_order_id, outcome_json, created_at,
                    delivery_status, attempt_count, last_attempt_at, last_error, delivered_at
             FROM buffer_records
             WHERE delivery_status IN ('PENDING', 'FAILED')",
        );
        if !exclude_devices.is_empty() {
            let placeholders: Vec<String> = (0..exclude_devices.len())
                .map(|i| format!("?{}", i + 2))
                .collect();
            sql.push_str(&format!(" AND device_id NOT IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY seq ASC LIMIT ?1");

        let mut stmt = conn.prepare(&sql)?;
        let max_n = max_n as i64;
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&max_n];
        for device in exclude_devices {
            bind.push(device);
        }
        let rows = stmt.query_map(bind.as_slice(), map_record)?;
        collect_records(rows)
    }

    /// 按事件ID读取单条记录
    pub fn get(&self, event_id: &Uuid) -> RepositoryResult<Option<BufferedRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, event_id, device_id, work_order_id, outcome_json, created_at,
                    delivery_status, attempt_count, last_attempt_at, last_error, delivered_at
             FROM buffer_records WHERE event_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![event_id.to_string()], map_record)?;
        match rows.next() {
            Some(row) => Ok(Some(decode_record(row?)?)),
            None => Ok(None),
        }
    }

    /// 追溯查询: 按工单/时间范围过滤,seq 升序
    ///
    /// 死信与未送达记录一并返回,由调用方通过 is_unsynced 标注。
    pub fn query_records(
        &self,
        work_order_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> RepositoryResult<Vec<BufferedRecord>> {
        let conn = self.get_conn()?;
        let mut sql = String::from(
            "SELECT seq, event_id, device_id, work_order_id, outcome_json, created_at,
                    delivery_status, attempt_count, last_attempt_at, last_error, delivered_at
             FROM buffer_records WHERE 1=1",
        );
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(wo) = work_order_id {
            sql.push_str(&format!(" AND work_order_id = ?{}", bind.len() + 1));
            bind.push(Box::new(wo.to_string()));
        }
        if let Some(s) = start {
            sql.push_str(&format!(" AND created_at >= ?{}", bind.len() + 1));
            bind.push(Box::new(s));
        }
        if let Some(e) = end {
            sql.push_str(&format!(" AND created_at <= ?{}", bind.len() + 1));
            bind.push(Box::new(e));
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), map_record)?;
        collect_records(rows)
    }

    /// 各投递状态的记录数统计
    pub fn stats(&self) -> RepositoryResult<BufferStats> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT delivery_status, COUNT(*) FROM buffer_records GROUP BY delivery_status",
        )?;
        let mut stats = BufferStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match DeliveryStatus::from_db(&status) {
                Some(DeliveryStatus::Pending) => stats.pending = count,
                Some(DeliveryStatus::InFlight) => stats.in_flight = count,
                Some(DeliveryStatus::Failed) => stats.failed = count,
                Some(DeliveryStatus::DeadLetter) => stats.dead_letter = count,
                Some(DeliveryStatus::Delivered) => stats.delivered = count,
                None => {}
            }
        }
        Ok(stats)
    }

    // ==========================================
    // 压缩操作
    // ==========================================

    /// 清除超出保留窗口的已送达记录
    ///
    /// 仅 DELIVERED 记录可被清除;Pending/InFlight/Failed/DeadLetter 永不删除。
    /// 与 append 共享同一连接锁,天然不会与写入并发操作同一记录。
    pub fn compact(&self, retention: Duration) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let cutoff = Utc::now() - retention;
        let rows = conn.execute(
            "DELETE FROM buffer_records
             WHERE delivery_status = 'DELIVERED' AND delivered_at < ?1",
            params![cutoff],
        )?;
        Ok(rows)
    }
}

// ==========================================
// 行映射
// ==========================================

type RawRecordRow = (
    i64,
    String,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
    String,
    i64,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<DateTime<Utc>>,
);

fn map_record(row: &Row<'_>) -> rusqlite::Result<RawRecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn decode_record(raw: RawRecordRow) -> RepositoryResult<BufferedRecord> {
    let (
        seq,
        event_id,
        device_id,
        work_order_id,
        outcome_json,
        created_at,
        status,
        attempt_count,
        last_attempt_at,
        last_error,
        delivered_at,
    ) = raw;

    let event_id = Uuid::parse_str(&event_id).map_err(|e| RepositoryError::CorruptRecord {
        seq,
        message: format!("event_id 非法: {}", e),
    })?;
    let outcome: ValidationOutcome =
        serde_json::from_str(&outcome_json).map_err(|e| RepositoryError::CorruptRecord {
            seq,
            message: format!("outcome_json 解析失败: {}", e),
        })?;
    let delivery_status =
        DeliveryStatus::from_db(&status).ok_or_else(|| RepositoryError::CorruptRecord {
            seq,
            message: format!("未知投递状态: {}", status),
        })?;

    Ok(BufferedRecord {
        seq,
        event_id,
        device_id,
        work_order_id,
        outcome,
        created_at,
        delivery_status,
        attempt_count: attempt_count as u32,
        last_attempt_at,
        last_error,
        delivered_at,
    })
}

fn collect_records<I>(rows: I) -> RepositoryResult<Vec<BufferedRecord>>
where
    I: Iterator<Item = rusqlite::Result<RawRecordRow>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(decode_record(row?)?);
    }
    Ok(out)
}

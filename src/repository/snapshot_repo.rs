// ==========================================
// 车间扫码追溯网关 - 工单/BoM 快照仓储
// ==========================================
// 职责: 缓存后端工单状态与 BoM 行,支撑离线上下文校验
// 约束: consumed_qty 只增不减,崩溃重启后由此恢复消耗计数
// ==========================================

use crate::domain::types::RemoteWorkOrderState;
use crate::domain::work_order::{ComponentRequirement, WorkOrderSnapshot};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

// ==========================================
// SnapshotRepository - 本地快照仓储
// ==========================================
pub struct SnapshotRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    // ==========================================
    // 工单快照
    // ==========================================

    /// 写入/更新工单快照（后端刷新成功时调用）
    pub fn upsert_work_order(&self, snapshot: &WorkOrderSnapshot) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO work_order_snapshots (work_order_id, remote_state, product_name, fetched_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(work_order_id) DO UPDATE SET
                remote_state = excluded.remote_state,
                product_name = excluded.product_name,
                fetched_at = excluded.fetched_at
            "#,
            params![
                snapshot.work_order_id,
                snapshot.remote_state.as_str(),
                snapshot.product_name,
                snapshot.fetched_at,
            ],
        )?;
        Ok(())
    }

    /// 读取工单快照（可能过期,由调用方决定是否兜底使用）
    pub fn get_work_order(&self, work_order_id: &str) -> RepositoryResult<Option<WorkOrderSnapshot>> {
        let conn = self.get_conn()?;
        let row: Option<(String, Option<String>, DateTime<Utc>)> = conn
            .query_row(
                "SELECT remote_state, product_name, fetched_at
                 FROM work_order_snapshots WHERE work_order_id = ?1",
                params![work_order_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((state, product_name, fetched_at)) => {
                let remote_state = RemoteWorkOrderState::from_db(&state).ok_or_else(|| {
                    RepositoryError::InternalError(format!("未知工单状态: {}", state))
                })?;
                Ok(Some(WorkOrderSnapshot {
                    work_order_id: work_order_id.to_string(),
                    remote_state,
                    product_name,
                    fetched_at,
                }))
            }
        }
    }

    // ==========================================
    // BoM 行
    // ==========================================

    /// 写入/刷新工单 BoM 行
    ///
    /// 存活行保留 consumed_qty（刷新 BoM 不得回退消耗计数）;
    /// 远端已移除的物料行一并删除,不得从陈旧行继续消耗。
    pub fn upsert_bom(
        &self,
        work_order_id: &str,
        lines: &[ComponentRequirement],
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        if lines.is_empty() {
            tx.execute(
                "DELETE FROM bom_lines WHERE work_order_id = ?1",
                params![work_order_id],
            )?;
        } else {
            let placeholders: Vec<String> = (0..lines.len())
                .map(|i| format!("?{}", i + 2))
                .collect();
            let sql = format!(
                "DELETE FROM bom_lines WHERE work_order_id = ?1 AND component_code NOT IN ({})",
                placeholders.join(", ")
            );
            let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&work_order_id];
            for line in lines {
                bind.push(&line.component_code);
            }
            tx.execute(&sql, bind.as_slice())?;
        }

        for line in lines {
            tx.execute(
                r#"
                INSERT INTO bom_lines (work_order_id, component_code, required_qty, consumed_qty)
                VALUES (?1, ?2, ?3, 0)
                ON CONFLICT(work_order_id, component_code) DO UPDATE SET
                    required_qty = excluded.required_qty
                "#,
                params![work_order_id, line.component_code, line.required_quantity],
            )?;
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    /// 读取工单全部 BoM 行（含已消耗计数）
    pub fn get_bom(&self, work_order_id: &str) -> RepositoryResult<Vec<ComponentRequirement>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT component_code, required_qty, consumed_qty
             FROM bom_lines WHERE work_order_id = ?1 ORDER BY component_code",
        )?;
        let rows = stmt.query_map(params![work_order_id], |row| {
            Ok(ComponentRequirement {
                component_code: row.get(0)?,
                required_quantity: row.get::<_, i64>(1)? as u32,
                consumed_quantity: row.get::<_, i64>(2)? as u32,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// 持久化某物料行的消耗计数（校验引擎接受扫码后写穿）
    pub fn set_consumed(
        &self,
        work_order_id: &str,
        component_code: &str,
        consumed: u32,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let rows = conn.execute(
            "UPDATE bom_lines SET consumed_qty = ?3
             WHERE work_order_id = ?1 AND component_code = ?2 AND consumed_qty <= ?3",
            params![work_order_id, component_code, consumed],
        )?;
        if rows == 0 {
            return Err(RepositoryError::NotFound {
                entity: "BomLine".to_string(),
                id: format!("{}/{}", work_order_id, component_code),
            });
        }
        Ok(())
    }
}

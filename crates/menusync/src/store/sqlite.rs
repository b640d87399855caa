//! SQLite 存储
//!
//! 单连接 + tokio Mutex；update_status 在一个事务内完成 读取 → 状态机 → 写回。
//! 时间统一存为 UTC 毫秒时间戳。

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::migrate::init_db;
use super::{
    Page, Pagination, PlatformBreakdown, SyncAnalytics, SyncFilter, SyncOperationStore,
    TransitionOutcome,
};
use crate::error::{MenuSyncError, Result};
use crate::platform::PlatformType;
use crate::sync::batch::{BatchSyncOperation, ExecutionMode};
use crate::sync::operation::{SyncOperation, SyncStatus, SyncTransition};

const COLUMNS: &str = "id, menu_id, platform_type, status, retry_count, started_at, completed_at, \
     duration_ms, items_processed, items_total, error_message, external_reference, batch_id, \
     retry_of, payload_checksum, last_attempt_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteSyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSyncStore {
    /// 打开（或创建）数据库文件并执行迁移
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path.as_ref())
            .map_err(|e| MenuSyncError::Database(format!("打开数据库失败: {}", e)))?;
        init_db(&mut conn)?;
        info!("✅ 同步记录数据库已打开: {}", path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        init_db(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<SyncOperation> {
        let platform: String = row.get(2)?;
        let status: String = row.get(3)?;
        Ok(SyncOperation {
            id: row.get(0)?,
            menu_id: row.get(1)?,
            platform_type: platform.parse().map_err(|e| conversion_error(2, e))?,
            status: status.parse().map_err(|e| conversion_error(3, e))?,
            retry_count: row.get(4)?,
            started_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
            completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
            duration_ms: row.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u64),
            items_processed: row.get(8)?,
            items_total: row.get(9)?,
            error_message: row.get(10)?,
            external_reference: row.get(11)?,
            batch_id: row.get(12)?,
            retry_of: row.get(13)?,
            payload_checksum: row.get(14)?,
            last_attempt_error: row.get(15)?,
            created_at: from_millis(row.get(16)?),
            updated_at: from_millis(row.get(17)?),
        })
    }

    fn write_operation(conn: &Connection, op: &SyncOperation) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_operation ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                COLUMNS
            ),
            params![
                op.id,
                op.menu_id,
                op.platform_type.as_str(),
                op.status.as_str(),
                op.retry_count,
                op.started_at.map(|t| t.timestamp_millis()),
                op.completed_at.map(|t| t.timestamp_millis()),
                op.duration_ms.map(|v| v as i64),
                op.items_processed,
                op.items_total,
                op.error_message,
                op.external_reference,
                op.batch_id,
                op.retry_of,
                op.payload_checksum,
                op.last_attempt_error,
                op.created_at.timestamp_millis(),
                op.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn query_one(conn: &Connection, id: &str) -> Result<Option<SyncOperation>> {
        let op = conn
            .query_row(
                &format!("SELECT {} FROM sync_operation WHERE id = ?1", COLUMNS),
                params![id],
                Self::row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    /// 构造 WHERE 子句与参数
    fn where_clause(filter: &SyncFilter) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(menu_id) = &filter.menu_id {
            args.push(SqlValue::Text(menu_id.clone()));
            clauses.push(format!("menu_id = ?{}", args.len()));
        }
        if let Some(platform) = filter.platform_type {
            args.push(SqlValue::Text(platform.as_str().to_string()));
            clauses.push(format!("platform_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(SqlValue::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(SqlValue::Integer(from.timestamp_millis()));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(SqlValue::Integer(to.timestamp_millis()));
            clauses.push(format!("created_at < ?{}", args.len()));
        }
        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), args)
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn conversion_error(column: usize, error: MenuSyncError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(error),
    )
}

fn mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Parallel => "parallel",
        ExecutionMode::Sequence => "sequence",
    }
}

#[async_trait]
impl SyncOperationStore for SqliteSyncStore {
    async fn create(&self, operation: &SyncOperation) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::write_operation(&conn, operation)
    }

    async fn update_status(&self, id: &str, transition: &SyncTransition) -> Result<TransitionOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let Some(mut op) = Self::query_one(&tx, id)? else {
            return Ok(TransitionOutcome::NotFound);
        };
        let previous = op.status;
        if !op.apply(transition, Utc::now()) {
            return Ok(TransitionOutcome::Ignored(op));
        }
        Self::write_operation(&tx, &op)?;
        tx.commit()?;
        Ok(TransitionOutcome::Applied {
            operation: op,
            previous,
        })
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncOperation>> {
        let conn = self.conn.lock().await;
        Self::query_one(&conn, id)
    }

    async fn find_by_menu_and_platform(
        &self,
        menu_id: &str,
        platform: PlatformType,
        active_only: bool,
    ) -> Result<Vec<SyncOperation>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM sync_operation WHERE menu_id = ?1 AND platform_type = ?2 {} \
             ORDER BY created_at DESC, id DESC",
            COLUMNS,
            if active_only {
                "AND status IN ('pending', 'in_progress')"
            } else {
                ""
            }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![menu_id, platform.as_str()], Self::row_to_operation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn list(&self, filter: &SyncFilter, pagination: Pagination) -> Result<Page<SyncOperation>> {
        let conn = self.conn.lock().await;
        let (where_sql, args) = Self::where_clause(filter);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sync_operation {}", where_sql),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM sync_operation {} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            COLUMNS,
            where_sql,
            pagination.limit,
            pagination.offset()
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), Self::row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page: pagination.page,
            limit: pagination.limit,
            total: total.max(0) as u64,
        })
    }

    async fn aggregate(
        &self,
        since: DateTime<Utc>,
        platform: Option<PlatformType>,
    ) -> Result<SyncAnalytics> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT platform_type,
                    COUNT(*),
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                    AVG(CASE WHEN status = 'completed' THEN duration_ms END)
             FROM sync_operation
             WHERE created_at >= ?1 AND (?2 IS NULL OR platform_type = ?2)
             GROUP BY platform_type",
        )?;
        let rows = stmt.query_map(
            params![since.timestamp_millis(), platform.map(|p| p.as_str())],
            |row| {
                let platform: String = row.get(0)?;
                Ok((
                    platform,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            },
        )?;

        let mut breakdown = Vec::new();
        for row in rows {
            let (platform, total, success, failure, avg) = row?;
            breakdown.push(PlatformBreakdown::new(
                platform.parse()?,
                total as u64,
                success as u64,
                failure as u64,
                avg.unwrap_or(0.0),
            ));
        }
        Ok(SyncAnalytics::from_breakdown(since, breakdown))
    }

    async fn create_batch(&self, batch: &BatchSyncOperation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sync_batch (id, menu_id, mode, fail_fast, member_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                batch.id,
                batch.menu_id,
                mode_str(batch.mode),
                batch.fail_fast,
                serde_json::to_string(&batch.member_ids)?,
                batch.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn find_batch(&self, id: &str) -> Result<Option<BatchSyncOperation>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, menu_id, mode, fail_fast, member_ids, created_at FROM sync_batch WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, menu_id, mode, fail_fast, members, created_at)) = row else {
            return Ok(None);
        };
        let mode = match mode.as_str() {
            "sequence" => ExecutionMode::Sequence,
            _ => ExecutionMode::Parallel,
        };
        Ok(Some(BatchSyncOperation {
            id,
            menu_id,
            mode,
            fail_fast,
            member_ids: serde_json::from_str(&members)?,
            created_at: from_millis(created_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[tokio::test]
    async fn test_transitions() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        conformance::transitions_are_atomic_and_terminal_is_final(&store).await;
    }

    #[tokio::test]
    async fn test_listing() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        conformance::pair_lookup_and_listing(&store).await;
    }

    #[tokio::test]
    async fn test_aggregate() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        conformance::aggregate_by_platform(&store).await;
    }

    #[tokio::test]
    async fn test_batches() {
        let store = SqliteSyncStore::open_in_memory().unwrap();
        conformance::batches_round_trip(&store).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        let op = SyncOperation::new("menu-1", PlatformType::Deliveroo, 4).with_checksum("abc");
        {
            let store = SqliteSyncStore::open(&path).unwrap();
            store.create(&op).await.unwrap();
            store.update_status(&op.id, &SyncTransition::Start).await.unwrap();
        }
        let store = SqliteSyncStore::open(&path).unwrap();
        let loaded = store.find_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SyncStatus::InProgress);
        assert_eq!(loaded.payload_checksum.as_deref(), Some("abc"));
        assert_eq!(loaded.items_total, 4);
    }
}

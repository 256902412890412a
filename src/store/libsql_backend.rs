//! libSQL backend — async `Database` trait implementation.
//!
//! Jobs are stored as JSON documents with a few indexed columns for
//! filtering. Quota records use plain columns so that credit updates can be
//! conditional single statements. Leases carry their expiry in epoch millis.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Job, JobId, JobStatus};
use crate::quota::{QuotaRecord, QuotaScope, UserType};
use crate::store::migrations;
use crate::store::traits::{Database, JobFilter};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn user_type_to_str(user_type: UserType) -> &'static str {
    match user_type {
        UserType::Normal => "normal",
        UserType::Vip => "vip",
    }
}

fn str_to_user_type(s: &str) -> UserType {
    match s {
        "vip" => UserType::Vip,
        _ => UserType::Normal,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn epoch_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let document: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job document: {e}")))?;
    serde_json::from_str(&document).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_quota(row: &libsql::Row) -> Result<QuotaRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let owner_kind: String = row.get(1)?;
    let owner_id: String = row.get(2)?;
    let available_num: i64 = row.get(3)?;
    let is_enable: i64 = row.get(4)?;
    let user_type: String = row.get(5)?;
    let valid_from: Option<String> = row.get(6).ok();
    let valid_until: Option<String> = row.get(7).ok();
    let allowed_formats: String = row.get(8)?;
    let marks: String = row.get(9)?;
    let weight: i64 = row.get(10)?;
    let created_at: String = row.get(11)?;

    let scope = match owner_kind.as_str() {
        "tenant" => QuotaScope::Tenant(owner_id),
        _ => QuotaScope::User(owner_id),
    };

    Ok(QuotaRecord {
        id: id.parse().unwrap_or_default(),
        scope,
        available_num,
        is_enable: is_enable != 0,
        user_type: str_to_user_type(&user_type),
        valid_from: valid_from.as_deref().map(parse_datetime),
        valid_until: valid_until.as_deref().map(parse_datetime),
        allowed_formats: serde_json::from_str(&allowed_formats).unwrap_or_default(),
        marks: serde_json::from_str(&marks).unwrap_or_default(),
        weight,
        created_at: parse_datetime(&created_at),
    })
}

const TERMINAL_STATUSES: &str =
    "'processed', 'process_failed', 'uploading_failed', 'canceled', 'download_failed', 'timeout'";

const QUOTA_COLUMNS: &str = "id, owner_kind, owner_id, available_num, is_enable, user_type, valid_from, valid_until, allowed_formats, marks, weight, created_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let document = to_json(job)?;
        self.conn()
            .execute(
                "INSERT INTO jobs (id, user_id, tenant_id, priority, status, worker_id, fingerprint, document, created_at, updated_at, timed_out_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.owner.user_id.clone(),
                    opt_text(job.owner.tenant_key()),
                    job.priority.as_str(),
                    job.status.to_string(),
                    opt_text(job.worker_id.map(|w| w.to_string()).as_deref()),
                    job.fingerprint.clone(),
                    document,
                    job.created_at.to_rfc3339(),
                    job.update_time.to_rfc3339(),
                    opt_datetime(job.timed_out_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let document = to_json(job)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, worker_id = ?2, document = ?3, updated_at = ?4, timed_out_at = ?5 WHERE id = ?6",
                params![
                    job.status.to_string(),
                    opt_text(job.worker_id.map(|w| w.to_string()).as_deref()),
                    document,
                    job.update_time.to_rfc3339(),
                    opt_datetime(job.timed_out_at),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: job.id.to_string(),
            });
        }
        debug!(job_id = %job.id, status = %job.status, "Job updated");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT document FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let status = filter.status.map(|s| s.to_string());
        let worker = filter.worker_id.map(|w| w.to_string());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT document FROM jobs
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR user_id = ?2)
                       AND (?3 IS NULL OR worker_id = ?3)
                       AND (?4 = 0 OR (status NOT IN ({TERMINAL_STATUSES}) AND timed_out_at IS NULL))
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT ?5"
                ),
                params![
                    opt_text(status.as_deref()),
                    opt_text(filter.user_id.as_deref()),
                    opt_text(worker.as_deref()),
                    filter.active_only as i64,
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_jobs: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("find_jobs: {e}"))),
            }
        }
        Ok(jobs)
    }

    // ── Quota records ───────────────────────────────────────────────

    async fn insert_quota(&self, record: &QuotaRecord) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO quotas ({QUOTA_COLUMNS}, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    record.id.to_string(),
                    record.scope.kind(),
                    record.scope.id().to_string(),
                    record.available_num,
                    record.is_enable as i64,
                    user_type_to_str(record.user_type),
                    opt_datetime(record.valid_from),
                    opt_datetime(record.valid_until),
                    to_json(&record.allowed_formats)?,
                    to_json(&record.marks)?,
                    record.weight,
                    record.created_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_quota: {e}")))?;
        Ok(())
    }

    async fn find_quotas(&self, scope: &QuotaScope) -> Result<Vec<QuotaRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUOTA_COLUMNS} FROM quotas WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY created_at ASC, rowid ASC"
                ),
                params![scope.kind(), scope.id().to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_quotas: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(
                    row_to_quota(&row)
                        .map_err(|e| DatabaseError::Query(format!("find_quotas row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("find_quotas: {e}"))),
            }
        }
        Ok(records)
    }

    async fn consume_quota(&self, id: Uuid, cost: u32) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE quotas SET available_num = available_num - ?1, updated_at = ?2
                 WHERE id = ?3 AND is_enable = 1 AND available_num >= ?1",
                params![i64::from(cost), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("consume_quota: {e}")))?;
        Ok(changed == 1)
    }

    async fn refund_quota(&self, id: Uuid, cost: u32) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE quotas SET available_num = available_num + ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(cost), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("refund_quota: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "quota".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Leases ──────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease ttl: {e}")))?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO leases (key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
                 WHERE leases.expires_at <= ?4",
                params![
                    key.to_string(),
                    token.to_string(),
                    epoch_millis(now + ttl),
                    epoch_millis(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease: {e}")))?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM leases WHERE key = ?1 AND token = ?2",
                params![key.to_string(), token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(changed == 1)
    }
}

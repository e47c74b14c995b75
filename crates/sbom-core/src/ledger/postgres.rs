//! PostgreSQL implementation of [`TaskLedger`] and [`ClusterLock`].
//!
//! Uses [`sqlx`] with the `postgres` feature.  Migrations are embedded at
//! compile time from `./migrations` and applied by [`PgLedger::connect`].
//!
//! # Claiming
//!
//! `claim_next_queued` selects the oldest `queued` row with
//! `FOR UPDATE SKIP LOCKED` and flips it to `running` in the same statement,
//! inside an explicit transaction.  Rows locked by an in-flight claim in
//! another session are skipped rather than waited on, and a transaction that
//! dies before commit releases its row lock for the next claimant.  A claimed
//! row that fails to decode is marked `failed` in the same transaction and
//! reported as [`LedgerError::CorruptRow`].
//!
//! # Cluster lock
//!
//! Maintenance exclusion uses session-scoped advisory locks, so the lease
//! pins the pool connection that took the lock until it is released.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used so that no
//! `DATABASE_URL` is needed at compile time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use tracing::{debug, warn};

use super::{exhausted_message, ClusterLock, TaskLedger, REAPED_FAIL_MESSAGE};
use crate::error::LedgerError;
use crate::types::{RunningTimeoutAction, StatusCounts, Task, TaskId, TaskStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const TASK_COLUMNS: &str = "id, status::text, ts, error, attempts";

type TaskRow = (String, String, DateTime<Utc>, Option<String>, i32);

/// Postgres-backed task ledger.
#[derive(Clone, Debug)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Open a pool against `url` and apply pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(Duration::from_secs(30 * 60))
            .connect(url)
            .await?;
        let ledger = Self::from_pool(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Wrap an existing pool.  Does not run migrations.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn task_from_row((id, status, ts, error, attempts): TaskRow) -> Result<Task, LedgerError> {
    let status = match status.parse::<TaskStatus>() {
        Ok(s) => s,
        Err(_) => {
            warn!(task_id = %id, raw = %status, "unrecognised task status in ledger");
            return Err(LedgerError::CorruptRow { id, value: status });
        }
    };
    let task_id = match TaskId::parse(&id) {
        Ok(t) => t,
        Err(e) => {
            warn!(raw = %id, error = %e, "invalid task id in ledger");
            return Err(LedgerError::CorruptRow { value: id.clone(), id });
        }
    };
    Ok(Task {
        id: task_id,
        status,
        timestamp: ts,
        error,
        attempts,
    })
}

fn insert_error(id: &TaskId, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return LedgerError::DuplicateId(id.clone());
        }
    }
    LedgerError::Store(e)
}

impl TaskLedger for PgLedger {
    async fn enqueue(&self, id: &TaskId) -> Result<Task, LedgerError> {
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO sbom_tasks (id, status, ts, error, attempts) \
             VALUES ($1, 'queued', now(), NULL, 0) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| insert_error(id, e))?;
        task_from_row(row)
    }

    async fn get(&self, id: &TaskId) -> Result<Task, LedgerError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM sbom_tasks WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => task_from_row(row),
            None => Err(LedgerError::NotFound(id.clone())),
        }
    }

    async fn claim_next_queued(&self) -> Result<Option<Task>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<TaskRow> = sqlx::query_as(
            "WITH next AS ( \
                 SELECT id FROM sbom_tasks \
                 WHERE status = 'queued' \
                 ORDER BY ts, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE sbom_tasks t \
             SET status = 'running', ts = now(), error = NULL, attempts = t.attempts + 1 \
             FROM next \
             WHERE t.id = next.id \
             RETURNING t.id, t.status::text, t.ts, t.error, t.attempts",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let task = match task_from_row(row) {
            Ok(task) => task,
            Err(LedgerError::CorruptRow { id, value }) => {
                // A corrupt row would otherwise head the queue forever.
                warn!(task_id = %id, %value, "failing corrupt task row");
                sqlx::query(
                    "UPDATE sbom_tasks SET status = 'failed', ts = now(), error = $2 WHERE id = $1",
                )
                .bind(&id)
                .bind(format!("corrupt task row: unexpected value {value:?}"))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Err(LedgerError::CorruptRow { id, value });
            }
            Err(e) => return Err(e),
        };
        tx.commit().await?;
        debug!(task_id = %task.id, attempts = task.attempts, "task claimed");
        Ok(Some(task))
    }

    async fn set_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE sbom_tasks \
             SET status = $2::sbom_task_status, ts = now(), error = $3 \
             WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn reap_stuck_running(
        &self,
        older_than: Duration,
        action: RunningTimeoutAction,
        max_attempts: u32,
    ) -> Result<u64, LedgerError> {
        let secs = older_than.as_secs_f64();
        let result = match action {
            RunningTimeoutAction::Fail => {
                sqlx::query(
                    "UPDATE sbom_tasks \
                     SET status = 'failed', ts = now(), error = $1 \
                     WHERE status = 'running' \
                       AND ts < now() - make_interval(secs => $2)",
                )
                .bind(REAPED_FAIL_MESSAGE)
                .bind(secs)
                .execute(&self.pool)
                .await?
            }
            RunningTimeoutAction::Requeue => {
                let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
                sqlx::query(
                    "UPDATE sbom_tasks \
                     SET status = CASE WHEN attempts < $3 \
                                       THEN 'queued'::sbom_task_status \
                                       ELSE 'failed'::sbom_task_status END, \
                         ts = now(), \
                         error = CASE WHEN attempts < $3 \
                                      THEN NULL \
                                      ELSE $1::text || ' after ' || attempts::text || ' attempts' END \
                     WHERE status = 'running' \
                       AND ts < now() - make_interval(secs => $2)",
                )
                .bind(REAPED_FAIL_MESSAGE)
                .bind(secs)
                .bind(max_attempts)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn list_expired(&self, older_than: Duration, limit: usize) -> Result<Vec<Task>, LedgerError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM sbom_tasks \
             WHERE status IN ('done', 'failed') \
               AND ts < now() - make_interval(secs => $1) \
             ORDER BY ts ASC \
             LIMIT $2"
        ))
        .bind(older_than.as_secs_f64())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        // A corrupt row is skipped here so it cannot wedge the whole batch.
        Ok(rows
            .into_iter()
            .filter_map(|row| task_from_row(row).ok())
            .collect())
    }

    async fn delete(&self, id: &TaskId) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM sbom_tasks WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn status_counts(&self) -> Result<StatusCounts, LedgerError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status::text, count(*) FROM sbom_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<TaskStatus>() {
                Ok(s) => counts.add(s, n),
                Err(_) => warn!(raw = %status, "unrecognised task status in ledger"),
            }
        }
        Ok(counts)
    }
}

/// A held advisory lock together with the session that owns it.
#[derive(Debug)]
pub struct AdvisoryLease {
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl AdvisoryLease {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        // Returning the connection to the pool would keep the session, and
        // with it the lock, alive.  Closing the session releases it.
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "advisory lease dropped without unlock; closing its session");
            drop(conn.detach());
        }
    }
}

impl ClusterLock for PgLedger {
    type Lease = AdvisoryLease;

    async fn try_lock(&self, key: i64) -> Result<Option<AdvisoryLease>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(AdvisoryLease {
            key,
            conn: Some(conn),
        }))
    }

    async fn unlock(&self, mut lease: AdvisoryLease) -> Result<(), LedgerError> {
        let Some(mut conn) = lease.conn.take() else {
            return Ok(());
        };
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lease.key)
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(key = lease.key, "advisory lock was not held at unlock");
                Ok(())
            }
            Err(e) => {
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

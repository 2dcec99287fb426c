use super::PoolReservation;
use crate::migrations::run_inline_migrations;
use crate::poller::Poller;
use crate::settings::PollSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use stratus_common::{CpiError, PoolFilter, PoolRecord, PoolState};

const RECORD_COLUMNS: &str =
    "id, name, in_use, cpu, memory_mb, ip, private_vlan, public_vlan, image_id, agent_id";

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Busy or locked; the same statement may succeed later.
    Contention,
    Fatal,
}

/// Classifies a SQLite result code as reported by the driver. Extended codes
/// (e.g. 261 `SQLITE_BUSY_RECOVERY`, 262 `SQLITE_LOCKED_SHAREDCACHE`) carry the
/// primary code in their low byte.
pub fn classify_result_code(code: &str) -> StoreErrorKind {
    match code.trim().parse::<i64>() {
        Ok(c) if matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED) => StoreErrorKind::Contention,
        _ => StoreErrorKind::Fatal,
    }
}

pub fn classify_store_error(err: &sqlx::Error) -> StoreErrorKind {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| classify_result_code(&c))
            .unwrap_or(StoreErrorKind::Fatal),
        sqlx::Error::PoolTimedOut => StoreErrorKind::Contention,
        _ => StoreErrorKind::Fatal,
    }
}

/// Runs `op` until it succeeds, it fails with a non-contention error, or the
/// poller's deadline passes. Contention past the deadline escalates to
/// [`CpiError::Timeout`], with the last [`CpiError::StoreContention`] as its
/// cause; anything else becomes [`CpiError::StoreFailure`].
pub async fn retry_on_contention<T, E, F, Fut>(
    poller: &Poller,
    op: &str,
    classify: fn(&E) -> StoreErrorKind,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let last_contention: Mutex<Option<String>> = Mutex::new(None);
    let last = &last_contention;
    let mut attempt: u32 = 0;
    let outcome = poller
        .poll(op, || {
            attempt += 1;
            let n = attempt;
            let fut = f();
            async move {
                match fut.await {
                    Ok(v) => Ok(Some(v)),
                    Err(e) => match classify(&e) {
                        StoreErrorKind::Contention => {
                            tracing::warn!(op, attempt = n, error = %e, "pool store busy, retrying");
                            *last.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                            Ok(None)
                        }
                        StoreErrorKind::Fatal => Err(anyhow::Error::new(e)
                            .context(CpiError::StoreFailure(op.to_string()))),
                    },
                }
            }
        })
        .await;

    let err = match outcome {
        Ok(v) => return Ok(v),
        Err(err) => err,
    };
    let cause = last_contention.into_inner().unwrap_or_else(|p| p.into_inner());
    match (cause, err.downcast_ref::<CpiError>()) {
        (Some(message), Some(CpiError::Timeout { condition, waited })) => {
            let timeout = CpiError::Timeout {
                condition: condition.clone(),
                waited: *waited,
            };
            Err(anyhow::Error::msg(message)
                .context(CpiError::StoreContention(op.to_string()))
                .context(timeout))
        }
        _ => Err(err),
    }
}

/// Column changes applied by [`PoolStore::update`]. Each present field is
/// written by its own statement; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmUpdate {
    pub state: Option<PoolState>,
    pub image_id: Option<String>,
    pub agent_id: Option<String>,
}

impl VmUpdate {
    pub fn state(state: PoolState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.image_id.is_none() && self.agent_id.is_none()
    }
}

/// Transactional accessor over the `vms` pool table.
#[derive(Clone)]
pub struct PoolStore {
    db: SqlitePool,
    retry: Poller,
}

impl PoolStore {
    pub fn new(db: SqlitePool, retry: PollSettings) -> Self {
        Self {
            db,
            retry: retry.into(),
        }
    }

    /// Opens (creating if needed) the database at `url` and migrates it.
    pub async fn connect(url: &str, max_connections: u32, retry: PollSettings) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid pool database url {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(500));
        let db = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to pool database {}", url))?;
        run_inline_migrations(&db)
            .await
            .context("migrating pool database")?;
        Ok(Self::new(db, retry))
    }

    pub async fn insert(&self, record: &PoolRecord) -> Result<()> {
        retry_on_contention(&self.retry, "insert vm", classify_store_error, || {
            self.try_insert(record)
        })
        .await?;
        tracing::info!(cid = record.cid, state = record.state.as_flag(), "pool record inserted");
        Ok(())
    }

    async fn try_insert(&self, r: &PoolRecord) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO vms (id, name, in_use, cpu, memory_mb, ip, private_vlan, public_vlan, image_id, agent_id, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
        )
        .bind(r.cid)
        .bind(&r.hostname)
        .bind(r.state.as_flag())
        .bind(r.cpu)
        .bind(r.memory_mb)
        .bind(&r.ip)
        .bind(r.private_vlan)
        .bind(r.public_vlan)
        .bind(&r.image_id)
        .bind(&r.agent_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Fails with [`CpiError::NotFound`] when no row has `cid`.
    pub async fn update(&self, cid: i64, changes: &VmUpdate) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let found = retry_on_contention(&self.retry, "update vm", classify_store_error, || {
            self.try_update(cid, changes)
        })
        .await?;
        if !found {
            return Err(CpiError::NotFound(format!("pool record {}", cid)).into());
        }
        tracing::debug!(cid, ?changes, "pool record updated");
        Ok(())
    }

    async fn try_update(&self, cid: i64, changes: &VmUpdate) -> Result<bool, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        let mut found = true;
        if let Some(state) = changes.state {
            let r = sqlx::query("UPDATE vms SET in_use = ?, timestamp = CURRENT_TIMESTAMP WHERE id = ?")
                .bind(state.as_flag())
                .bind(cid)
                .execute(&mut *tx)
                .await?;
            found &= r.rows_affected() > 0;
        }
        if let Some(image_id) = &changes.image_id {
            let r = sqlx::query("UPDATE vms SET image_id = ? WHERE id = ?")
                .bind(image_id)
                .bind(cid)
                .execute(&mut *tx)
                .await?;
            found &= r.rows_affected() > 0;
        }
        if let Some(agent_id) = &changes.agent_id {
            let r = sqlx::query("UPDATE vms SET agent_id = ? WHERE id = ?")
                .bind(agent_id)
                .bind(cid)
                .execute(&mut *tx)
                .await?;
            found &= r.rows_affected() > 0;
        }
        if !found {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, cid: i64) -> Result<bool> {
        let removed = retry_on_contention(&self.retry, "delete vm", classify_store_error, || async move {
            let mut tx = self.db.begin().await?;
            let r = sqlx::query("DELETE FROM vms WHERE id = ?")
                .bind(cid)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(r.rows_affected() > 0)
        })
        .await?;
        if removed {
            tracing::info!(cid, "pool record deleted");
        }
        Ok(removed)
    }

    pub async fn find_by_id(&self, cid: i64, state: Option<PoolState>) -> Result<Option<PoolRecord>> {
        let mut sql = format!("SELECT {} FROM vms WHERE id = ?", RECORD_COLUMNS);
        if state.is_some() {
            sql.push_str(" AND in_use = ?");
        }
        let sql = sql.as_str();
        retry_on_contention(&self.retry, "find vm by id", classify_store_error, || async move {
            let mut tx = self.db.begin().await?;
            let mut q = sqlx::query_as::<_, PoolRecord>(sql).bind(cid);
            if let Some(s) = state {
                q = q.bind(s.as_flag());
            }
            let row = q.fetch_optional(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(row)
        })
        .await
    }

    /// Most recently touched record owned by `agent_id`.
    pub async fn find_by_agent_id(
        &self,
        agent_id: &str,
        state: Option<PoolState>,
    ) -> Result<Option<PoolRecord>> {
        let mut sql = format!("SELECT {} FROM vms WHERE agent_id = ?", RECORD_COLUMNS);
        if state.is_some() {
            sql.push_str(" AND in_use = ?");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT 1");
        let sql = sql.as_str();
        retry_on_contention(&self.retry, "find vm by agent id", classify_store_error, || async move {
            let mut tx = self.db.begin().await?;
            let mut q = sqlx::query_as::<_, PoolRecord>(sql).bind(agent_id);
            if let Some(s) = state {
                q = q.bind(s.as_flag());
            }
            let row = q.fetch_optional(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(row)
        })
        .await
    }

    pub async fn list(&self, state: Option<PoolState>) -> Result<Vec<PoolRecord>> {
        let mut sql = format!("SELECT {} FROM vms", RECORD_COLUMNS);
        if state.is_some() {
            sql.push_str(" WHERE in_use = ?");
        }
        sql.push_str(" ORDER BY id");
        let sql = sql.as_str();
        retry_on_contention(&self.retry, "list vms", classify_store_error, || async move {
            let mut tx = self.db.begin().await?;
            let mut q = sqlx::query_as::<_, PoolRecord>(sql);
            if let Some(s) = state {
                q = q.bind(s.as_flag());
            }
            let rows = q.fetch_all(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        })
        .await
    }

    async fn try_reserve(
        &self,
        filter: &PoolFilter,
        agent_id: &str,
    ) -> Result<Option<PoolRecord>, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        // Single conditional statement: a row already claimed by a concurrent
        // reservation fails the `in_use = 'f'` guard and is not returned twice.
        let sql = format!(
            "UPDATE vms SET in_use = 't', agent_id = ?, timestamp = CURRENT_TIMESTAMP
             WHERE id = (
                 SELECT id FROM vms
                 WHERE in_use = 'f' AND cpu = ? AND memory_mb = ? AND private_vlan = ? AND public_vlan = ?
                 ORDER BY timestamp, id LIMIT 1
             ) AND in_use = 'f'
             RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, PoolRecord>(&sql)
            .bind(agent_id)
            .bind(filter.cpu)
            .bind(filter.memory_mb)
            .bind(filter.private_vlan)
            .bind(filter.public_vlan)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }
}

#[async_trait]
impl PoolReservation for PoolStore {
    async fn reserve(&self, filter: &PoolFilter, agent_id: &str) -> Result<Option<PoolRecord>> {
        let claimed = retry_on_contention(&self.retry, "reserve vm", classify_store_error, || {
            self.try_reserve(filter, agent_id)
        })
        .await?;
        match &claimed {
            Some(r) => tracing::info!(cid = r.cid, agent_id, "reserved free pool vm"),
            None => tracing::info!(?filter, "no free pool vm matches"),
        }
        Ok(claimed)
    }

    async fn lookup(&self, cid: i64) -> Result<Option<PoolRecord>> {
        self.find_by_id(cid, None).await
    }
}

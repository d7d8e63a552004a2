use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::error::{EngineError, Result};
use crate::scheduler::job::{Job, JobId, JobUpdate, NewJob, RequestKind, Target, UserId};
use crate::store::{FinishedQuery, JobStore};

const JOB_COLUMNS: &str = "id, user_id, username, email, mpc_name, ra_deg, dec_deg, \
    radec_epoch_year, propermotion_ra, propermotion_dec, mjd_min, mjd_max, use_reduced, \
    request_type, parent_task_id, send_email, from_api, comment, created_at, started_at, \
    finished_at, queuepos_relative, error_msg, is_archived";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    user_id: i64,
    username: String,
    email: Option<String>,
    mpc_name: Option<String>,
    ra_deg: Option<f64>,
    dec_deg: Option<f64>,
    radec_epoch_year: Option<f64>,
    propermotion_ra: Option<f64>,
    propermotion_dec: Option<f64>,
    mjd_min: Option<f64>,
    mjd_max: Option<f64>,
    use_reduced: bool,
    request_type: String,
    parent_task_id: Option<i64>,
    send_email: bool,
    from_api: bool,
    comment: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    queuepos_relative: Option<i32>,
    error_msg: Option<String>,
    is_archived: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = EngineError;

    fn try_from(row: JobRow) -> Result<Self> {
        let kind = RequestKind::from_code(&row.request_type).ok_or_else(|| {
            EngineError::Internal(format!(
                "job {} has unknown request type {:?}",
                row.id, row.request_type
            ))
        })?;
        let target = match (row.mpc_name, row.ra_deg, row.dec_deg) {
            (Some(name), _, _) => Target::Object { name },
            (None, Some(ra), Some(dec)) => Target::Coordinates {
                ra,
                dec,
                epoch_year: row.radec_epoch_year,
                pm_ra: row.propermotion_ra,
                pm_dec: row.propermotion_dec,
            },
            _ => {
                return Err(EngineError::Internal(format!(
                    "job {} has neither an object name nor coordinates",
                    row.id
                )))
            }
        };

        Ok(Job {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            email: row.email,
            target,
            kind,
            parent_id: row.parent_task_id,
            mjd_min: row.mjd_min,
            mjd_max: row.mjd_max,
            use_reduced: row.use_reduced,
            send_email: row.send_email,
            from_api: row.from_api,
            comment: row.comment,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            queue_position: row.queuepos_relative,
            error_msg: row.error_msg,
            is_archived: row.is_archived,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Job store backed by the `jobs` table in Postgres
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let (mpc_name, ra, dec, epoch, pm_ra, pm_dec) = match &new.target {
            Target::Object { name } => (Some(name.as_str()), None, None, None, None, None),
            Target::Coordinates {
                ra,
                dec,
                epoch_year,
                pm_ra,
                pm_dec,
            } => (None, Some(*ra), Some(*dec), *epoch_year, *pm_ra, *pm_dec),
        };

        let sql = format!(
            r"
            INSERT INTO jobs (user_id, username, email, mpc_name, ra_deg, dec_deg,
                radec_epoch_year, propermotion_ra, propermotion_dec, mjd_min, mjd_max,
                use_reduced, request_type, parent_task_id, send_email, from_api, comment,
                created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {JOB_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(new.user_id)
            .bind(&new.username)
            .bind(&new.email)
            .bind(mpc_name)
            .bind(ra)
            .bind(dec)
            .bind(epoch)
            .bind(pm_ra)
            .bind(pm_dec)
            .bind(new.mjd_min)
            .bind(new.mjd_max)
            .bind(new.use_reduced)
            .bind(new.kind.code())
            .bind(new.parent_id)
            .bind(new.send_email)
            .bind(new.from_api)
            .bind(&new.comment)
            .bind(new.created_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn exists(&self, id: JobId) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let sql = format!(
            r"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE finished_at IS NULL AND NOT is_archived
            ORDER BY queuepos_relative ASC NULLS LAST, created_at ASC, id ASC
            "
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn list_finished(&self, query: &FinishedQuery) -> Result<Vec<Job>> {
        let sql = format!(
            r"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE finished_at IS NOT NULL
              AND finished_at < $1
              AND ($2::TEXT IS NULL OR request_type = $2)
              AND ($3::BOOLEAN IS NULL OR is_archived = $3)
              AND ($4::BOOLEAN IS NULL OR from_api = $4)
            ORDER BY id ASC
            "
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(query.finished_before)
            .bind(query.kind.map(|kind| kind.code()))
            .bind(query.archived)
            .bind(query.from_api)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn list_batch(&self, user_id: UserId, created_at: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 AND created_at = $2 AND send_email ORDER BY id"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(user_id)
            .bind(created_at)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn list_ids(&self) -> Result<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM jobs")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                started_at = COALESCE(started_at, $2),
                finished_at = COALESCE($3, finished_at),
                error_msg = COALESCE($4, error_msg),
                queuepos_relative = CASE WHEN $5 THEN NULL ELSE queuepos_relative END,
                is_archived = COALESCE($6, is_archived)
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.error_msg)
        .bind(update.clear_position)
        .bind(update.archived)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_positions(&self, positions: &HashMap<JobId, i32>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, pos) in positions {
            sqlx::query("UPDATE jobs SET queuepos_relative = $2 WHERE id = $1")
                .bind(id)
                .bind(pos)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

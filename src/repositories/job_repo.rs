use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use jiff::Timestamp;
use jiff_diesel::ToDiesel;
use uuid::Uuid;

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult};
use crate::jobs::models::{
    DeadLetterEntry, DeadLetterRecord, Job, JobChangeset, JobPatch, JobRecord, JobStats, NewJob,
};
use crate::jobs::types::JobStatus;
use crate::repositories::JobStore;
use crate::schema::{dead_letters, jobs};

#[derive(Clone)]
pub struct JobRepository {
    pool: AsyncDbPool,
}

impl JobRepository {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> AppResult<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>>
    {
        self.pool.get().await.map_err(|e| AppError::ConnectionPool {
            source: anyhow::Error::from(e),
        })
    }
}

/// Explains why a conditional update on `id` matched no row.
async fn transition_error(conn: &mut AsyncPgConnection, id: Uuid, expected: JobStatus) -> AppError {
    let actual = jobs::table
        .find(id)
        .select(jobs::status)
        .first::<JobStatus>(conn)
        .await
        .optional();

    match actual {
        Ok(Some(actual)) => AppError::InvalidTransition {
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        },
        Ok(None) => AppError::job_not_found(id),
        Err(e) => AppError::from(e),
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn enqueue(&self, job: NewJob) -> AppResult<Job> {
        let mut conn = self.conn().await?;
        let record = JobRecord::from(&job.into_job(Timestamp::now()));

        diesel::insert_into(jobs::table)
            .values(&record)
            .returning(JobRecord::as_returning())
            .get_result(&mut conn)
            .await
            .map(Job::from)
            .map_err(AppError::from)
    }

    async fn claim_next(&self, now: Timestamp) -> AppResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let changeset = JobChangeset::from_patch(&JobPatch::running(now), now);

        let claimed = conn
            .transaction::<_, AppError, _>(|conn| {
                async move {
                    let candidate = jobs::table
                        .select(jobs::id)
                        .filter(jobs::status.eq(JobStatus::Pending))
                        .filter(jobs::scheduled_for.le(now.to_diesel()))
                        .order((
                            jobs::priority.desc(),
                            jobs::scheduled_for.asc(),
                            jobs::created_at.asc(),
                        ))
                        .limit(1)
                        .for_update()
                        .skip_locked()
                        .first::<Uuid>(conn)
                        .await
                        .optional()?;

                    let Some(id) = candidate else {
                        return Ok(None);
                    };

                    let record = diesel::update(jobs::table.find(id))
                        .set(&changeset)
                        .returning(JobRecord::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok(Some(record))
                }
                .scope_boxed()
            })
            .await?;

        Ok(claimed.map(Job::from))
    }

    async fn get(&self, id: Uuid) -> AppResult<Job> {
        let mut conn = self.conn().await?;

        jobs::table
            .find(id)
            .select(JobRecord::as_select())
            .first(&mut conn)
            .await
            .map(Job::from)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => AppError::job_not_found(id),
                _ => AppError::from(e),
            })
    }

    async fn update_job(&self, id: Uuid, expected: JobStatus, patch: JobPatch) -> AppResult<Job> {
        let mut conn = self.conn().await?;
        let changeset = JobChangeset::from_patch(&patch, Timestamp::now());

        let updated = diesel::update(
            jobs::table
                .filter(jobs::id.eq(id))
                .filter(jobs::status.eq(expected)),
        )
        .set(&changeset)
        .returning(JobRecord::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        match updated {
            Some(record) => Ok(Job::from(record)),
            None => Err(transition_error(&mut conn, id, expected).await),
        }
    }

    async fn dead_letter(
        &self,
        id: Uuid,
        patch: JobPatch,
        entry: DeadLetterEntry,
    ) -> AppResult<()> {
        let mut conn = self.conn().await?;
        let changeset = JobChangeset::from_patch(&patch, Timestamp::now());
        let record = DeadLetterRecord::from(&entry);

        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let updated = diesel::update(
                    jobs::table
                        .filter(jobs::id.eq(id))
                        .filter(jobs::status.eq(JobStatus::Running)),
                )
                .set(&changeset)
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Err(transition_error(conn, id, JobStatus::Running).await);
                }

                diesel::insert_into(dead_letters::table)
                    .values(&record)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_stale(&self, cutoff: Timestamp) -> AppResult<Vec<Job>> {
        let mut conn = self.conn().await?;

        let records = jobs::table
            .filter(jobs::status.eq(JobStatus::Running))
            .filter(jobs::started_at.lt(cutoff.to_diesel()))
            .order(jobs::started_at.asc())
            .select(JobRecord::as_select())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(Job::from).collect())
    }

    async fn stats(&self) -> AppResult<JobStats> {
        let mut conn = self.conn().await?;

        let counts: Vec<(JobStatus, i64)> = jobs::table
            .group_by(jobs::status)
            .select((jobs::status, diesel::dsl::count_star()))
            .load(&mut conn)
            .await?;

        let unresolved_dead_letters = dead_letters::table
            .filter(dead_letters::resolved_at.is_null())
            .count()
            .get_result::<i64>(&mut conn)
            .await?;

        let mut stats = JobStats {
            unresolved_dead_letters,
            ..JobStats::default()
        };
        for (status, count) in counts {
            stats.record(status, count);
        }
        Ok(stats)
    }

    async fn list_dead_letters(
        &self,
        unresolved_only: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn().await?;

        let mut query = dead_letters::table.into_boxed();
        if unresolved_only {
            query = query.filter(dead_letters::resolved_at.is_null());
        }

        let records = query
            .order(dead_letters::failed_at.desc())
            .limit(limit)
            .select(DeadLetterRecord::as_select())
            .load(&mut conn)
            .await?;

        Ok(records.into_iter().map(DeadLetterEntry::from).collect())
    }

    async fn resolve_dead_letter(&self, id: Uuid, notes: String) -> AppResult<DeadLetterEntry> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            dead_letters::table
                .filter(dead_letters::id.eq(id))
                .filter(dead_letters::resolved_at.is_null()),
        )
        .set((
            dead_letters::resolved_at.eq(Timestamp::now().to_diesel()),
            dead_letters::resolution_notes.eq(notes),
        ))
        .returning(DeadLetterRecord::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        if let Some(record) = updated {
            return Ok(DeadLetterEntry::from(record));
        }

        let exists = dead_letters::table
            .find(id)
            .select(dead_letters::id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;

        Err(match exists {
            Some(_) => AppError::InvalidTransition {
                id: id.to_string(),
                expected: "unresolved".to_string(),
                actual: "resolved".to_string(),
            },
            None => AppError::NotFound {
                entity: "DeadLetter".to_string(),
                field: "id".to_string(),
                value: id.to_string(),
            },
        })
    }

    async fn retry_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        patch: JobPatch,
        notes: String,
    ) -> AppResult<(Job, usize)> {
        let mut conn = self.conn().await?;
        let now = Timestamp::now();
        let changeset = JobChangeset::from_patch(&patch, now);

        conn.transaction::<_, AppError, _>(|conn| {
            async move {
                let updated = diesel::update(
                    jobs::table
                        .filter(jobs::id.eq(id))
                        .filter(jobs::status.eq(expected)),
                )
                .set(&changeset)
                .returning(JobRecord::as_returning())
                .get_result(conn)
                .await
                .optional()?;

                let Some(record) = updated else {
                    return Err(transition_error(conn, id, expected).await);
                };

                let resolved = diesel::update(
                    dead_letters::table
                        .filter(dead_letters::job_id.eq(id))
                        .filter(dead_letters::resolved_at.is_null()),
                )
                .set((
                    dead_letters::resolved_at.eq(now.to_diesel()),
                    dead_letters::resolution_notes.eq(notes),
                ))
                .execute(conn)
                .await?;

                Ok((Job::from(record), resolved))
            }
            .scope_boxed()
        })
        .await
    }
}

use async_trait::async_trait;
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use jiff::Timestamp;
use jiff_diesel::ToDiesel;

use crate::db::AsyncDbPool;
use crate::error::{AppError, AppResult};
use crate::ratelimit::BucketRecord;
use crate::repositories::BucketStore;
use crate::schema::rate_limit_buckets;

/// Scale of the `tokens` NUMERIC column.
const TOKEN_SCALE: i64 = 4;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = rate_limit_buckets)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct BucketRow {
    name: String,
    tokens: BigDecimal,
    last_refill_time: jiff_diesel::Timestamp,
    updated_at: jiff_diesel::Timestamp,
}

impl From<BucketRow> for BucketRecord {
    fn from(row: BucketRow) -> Self {
        Self {
            name: row.name,
            tokens: row.tokens.to_f64().unwrap_or(0.0),
            last_refill_time: row.last_refill_time.to_jiff(),
        }
    }
}

impl BucketRow {
    fn from_record(record: &BucketRecord, now: Timestamp) -> Self {
        let tokens = BigDecimal::from_f64(record.tokens)
            .unwrap_or_default()
            .with_scale(TOKEN_SCALE);
        Self {
            name: record.name.clone(),
            tokens,
            last_refill_time: record.last_refill_time.to_diesel(),
            updated_at: now.to_diesel(),
        }
    }
}

#[derive(Clone)]
pub struct BucketRepository {
    pool: AsyncDbPool,
}

impl BucketRepository {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BucketStore for BucketRepository {
    async fn load(&self, name: &str) -> AppResult<Option<BucketRecord>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| AppError::ConnectionPool {
                source: anyhow::Error::from(e),
            })?;

        rate_limit_buckets::table
            .find(name)
            .select(BucketRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map(|row| row.map(BucketRecord::from))
            .map_err(AppError::from)
    }

    async fn save(&self, record: BucketRecord) -> AppResult<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| AppError::ConnectionPool {
                source: anyhow::Error::from(e),
            })?;

        let row = BucketRow::from_record(&record, Timestamp::now());
        diesel::insert_into(rate_limit_buckets::table)
            .values(&row)
            .on_conflict(rate_limit_buckets::name)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(AppError::from)
    }

    async fn list(&self) -> AppResult<Vec<BucketRecord>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| AppError::ConnectionPool {
                source: anyhow::Error::from(e),
            })?;

        rate_limit_buckets::table
            .order(rate_limit_buckets::name.asc())
            .select(BucketRow::as_select())
            .load(&mut conn)
            .await
            .map(|rows| rows.into_iter().map(BucketRecord::from).collect())
            .map_err(AppError::from)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatmap_core::repository::{ExpiredPage, NewSeat, ScanCursor, SeatInventoryStore, StoreError, StoreResult};
use seatmap_shared::{EventId, HolderToken, SeatId, SeatRecord, SeatState, SeatStatus};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use tracing::{error, info};

const SEAT_COLUMNS: &str = "event_id, seat_id, section, status, holder_token, expires_at, version";

/// Seat records in the `seats` table. Compare-and-set is a single
/// conditional `UPDATE ... WHERE version = $n`.
#[derive(Clone)]
pub struct PgSeatStore {
    pub pool: Pool<Postgres>,
}

impl PgSeatStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    error!("Postgres error: {}", e);
    StoreError::Unavailable(e.to_string())
}

fn record_from_row(row: &PgRow) -> StoreResult<SeatRecord> {
    let raw_status: String = row.try_get("status").map_err(unavailable)?;
    let status: SeatStatus = raw_status
        .parse()
        .map_err(|e| StoreError::Unavailable(format!("bad seat row: {}", e)))?;
    let holder: Option<String> = row.try_get("holder_token").map_err(unavailable)?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").map_err(unavailable)?;
    let version: i64 = row.try_get("version").map_err(unavailable)?;

    let state = SeatState::from_parts(status, holder.map(HolderToken::new), expires_at)
        .ok_or_else(|| StoreError::Unavailable(format!("inconsistent {} seat row", status)))?;

    Ok(SeatRecord {
        event_id: EventId::new(row.try_get::<String, _>("event_id").map_err(unavailable)?),
        seat_id: SeatId::new(row.try_get::<String, _>("seat_id").map_err(unavailable)?),
        section: row.try_get("section").map_err(unavailable)?,
        state,
        version: version as u64,
    })
}

#[async_trait]
impl SeatInventoryStore for PgSeatStore {
    async fn get(&self, event_id: &EventId, seat_id: &SeatId) -> StoreResult<SeatRecord> {
        let sql = format!("SELECT {} FROM seats WHERE event_id = $1 AND seat_id = $2", SEAT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(event_id.as_str())
            .bind(seat_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::not_found(event_id, seat_id)),
        }
    }

    async fn compare_and_set(
        &self,
        event_id: &EventId,
        seat_id: &SeatId,
        expected_version: u64,
        next: SeatState,
    ) -> StoreResult<u64> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE seats
               SET status = $3, holder_token = $4, expires_at = $5,
                   version = version + 1, updated_at = NOW()
             WHERE event_id = $1 AND seat_id = $2 AND version = $6
            RETURNING version
            "#,
        )
        .bind(event_id.as_str())
        .bind(seat_id.as_str())
        .bind(next.status().as_str())
        .bind(next.holder_token().map(HolderToken::as_str))
        .bind(next.expires_at())
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        if let Some(version) = updated {
            return Ok(version as u64);
        }

        // Lost the race or the seat does not exist; find out which.
        let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM seats WHERE event_id = $1 AND seat_id = $2")
            .bind(event_id.as_str())
            .bind(seat_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        match actual {
            Some(actual) => Err(StoreError::conflict(event_id, seat_id, expected_version, actual as u64)),
            None => Err(StoreError::not_found(event_id, seat_id)),
        }
    }

    async fn scan_expired_page(
        &self,
        now: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> StoreResult<ExpiredPage> {
        let after = cursor.map(ScanCursor::seat_key).transpose()?;
        let (after_event, after_seat) = match &after {
            Some((event, seat)) => (Some(event.as_str()), Some(seat.as_str())),
            None => (None, None),
        };

        let sql = format!(
            r#"
            SELECT {}
              FROM seats
             WHERE status IN ('RESERVED', 'LOCKED')
               AND expires_at <= $1
               AND ($2::TEXT IS NULL OR (event_id, seat_id) > ($2, $3))
             ORDER BY event_id, seat_id
             LIMIT $4
            "#,
            SEAT_COLUMNS
        );
        // One extra row tells us whether another page exists.
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(after_event)
            .bind(after_seat)
            .bind(limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut records = rows.iter().map(record_from_row).collect::<StoreResult<Vec<_>>>()?;
        let has_more = records.len() > limit;
        records.truncate(limit);

        let next = match records.last() {
            Some(last) if has_more => Some(ScanCursor::after_seat(&last.event_id, &last.seat_id)),
            _ => None,
        };
        Ok(ExpiredPage { records, next })
    }

    async fn list(&self, event_id: &EventId) -> StoreResult<Vec<SeatRecord>> {
        let sql = format!("SELECT {} FROM seats WHERE event_id = $1 ORDER BY seat_id", SEAT_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(event_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut inserted = 0;

        for seat in seats {
            let result = sqlx::query(
                r#"
                INSERT INTO seats (event_id, seat_id, section, status, version)
                VALUES ($1, $2, $3, 'AVAILABLE', 0)
                ON CONFLICT (event_id, seat_id) DO NOTHING
                "#,
            )
            .bind(event_id.as_str())
            .bind(seat.seat_id.as_str())
            .bind(seat.section.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(unavailable)?;
        info!("Provisioned {} new seat(s) for event {}", inserted, event_id);
        Ok(inserted)
    }
}

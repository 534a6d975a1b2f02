use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use seatmap_core::repository::{ExpiredPage, NewSeat, ScanCursor, SeatInventoryStore, StoreError, StoreResult};
use seatmap_shared::{EventId, HolderToken, SeatId, SeatRecord, SeatState, SeatStatus};
use std::collections::HashMap;
use tracing::{error, info};

/// Lex-ordered index of every live or lapsed hold. Members are
/// `{expires_ms:020}\x1f{event_id}\x1f{seat_id}`, all with score 0, so a
/// range up to `now` yields exactly the expired ones in deadline order.
const HOLD_INDEX_KEY: &str = "seatmap:holds";
const SEP: char = '\u{1f}';

// KEYS: seat hash, hold index
// ARGV: expected version, status, holder, expires_ms, index member ('' = none)
// Returns {0, new_version} | {1, actual_version} | {2, 0} when the seat is missing.
const CAS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {2, 0}
end
local current = tonumber(redis.call('HGET', KEYS[1], 'version'))
if current ~= tonumber(ARGV[1]) then
    return {1, current}
end
local old = redis.call('HGET', KEYS[1], 'hold_member')
if old then
    redis.call('ZREM', KEYS[2], old)
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'version', current + 1)
for i, field in ipairs({'holder', 'expires_ms', 'hold_member'}) do
    local value = ARGV[i + 2]
    if value == '' then
        redis.call('HDEL', KEYS[1], field)
    else
        redis.call('HSET', KEYS[1], field, value)
    end
end
if ARGV[5] ~= '' then
    redis.call('ZADD', KEYS[2], 0, ARGV[5])
end
return {0, current + 1}
"#;

// KEYS: seat hash, event seat index
// ARGV: seat id, section ('' = none)
const PROVISION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'status', 'AVAILABLE', 'version', 0)
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'section', ARGV[2])
end
redis.call('ZADD', KEYS[2], 0, ARGV[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisSeatStore {
    conn: MultiplexedConnection,
    cas: redis::Script,
    provision: redis::Script,
}

impl RedisSeatStore {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis seat store");
        Ok(Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
            provision: redis::Script::new(PROVISION_SCRIPT),
        })
    }
}

/// The event id is length-prefixed: ids may contain `:` themselves.
fn seat_key(event_id: &EventId, seat_id: &SeatId) -> String {
    format!("seatmap:seat:{}:{}:{}", event_id.as_str().len(), event_id, seat_id)
}

fn event_index_key(event_id: &EventId) -> String {
    format!("seatmap:event:{}:seats", event_id)
}

fn hold_member(expires_at: DateTime<Utc>, event_id: &EventId, seat_id: &SeatId) -> String {
    format!("{:020}{}{}{}{}", expires_at.timestamp_millis().max(0), SEP, event_id, SEP, seat_id)
}

fn parse_hold_member(member: &str) -> Option<(EventId, SeatId)> {
    let mut parts = member.splitn(3, SEP);
    let _expires = parts.next()?;
    let event = parts.next()?;
    let seat = parts.next()?;
    Some((EventId::new(event), SeatId::new(seat)))
}

fn unavailable(e: redis::RedisError) -> StoreError {
    error!("Redis error: {}", e);
    StoreError::Unavailable(e.to_string())
}

fn corrupt(event_id: &EventId, seat_id: &SeatId, what: &str) -> StoreError {
    StoreError::Unavailable(format!("corrupt seat hash {}/{}: {}", event_id, seat_id, what))
}

fn record_from_hash(
    event_id: &EventId,
    seat_id: &SeatId,
    mut fields: HashMap<String, String>,
) -> StoreResult<SeatRecord> {
    let status = fields
        .get("status")
        .ok_or_else(|| corrupt(event_id, seat_id, "no status"))?
        .parse::<SeatStatus>()
        .map_err(|e| corrupt(event_id, seat_id, &e.to_string()))?;
    let version: u64 = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| corrupt(event_id, seat_id, "bad version"))?;
    let expires_at = match fields.get("expires_ms") {
        Some(ms) => Some(
            ms.parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| corrupt(event_id, seat_id, "bad expires_ms"))?,
        ),
        None => None,
    };
    let holder = fields.remove("holder").map(HolderToken::new);

    let state = SeatState::from_parts(status, holder, expires_at)
        .ok_or_else(|| corrupt(event_id, seat_id, "status does not match holder/expiry"))?;

    Ok(SeatRecord {
        event_id: event_id.clone(),
        seat_id: seat_id.clone(),
        section: fields.remove("section"),
        state,
        version,
    })
}

#[async_trait]
impl SeatInventoryStore for RedisSeatStore {
    async fn get(&self, event_id: &EventId, seat_id: &SeatId) -> StoreResult<SeatRecord> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(seat_key(event_id, seat_id)).await.map_err(unavailable)?;
        if fields.is_empty() {
            return Err(StoreError::not_found(event_id, seat_id));
        }
        record_from_hash(event_id, seat_id, fields)
    }

    async fn compare_and_set(
        &self,
        event_id: &EventId,
        seat_id: &SeatId,
        expected_version: u64,
        next: SeatState,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let expires_ms = next.expires_at().map(|at| at.timestamp_millis().to_string());
        let member = next.expires_at().map(|at| hold_member(at, event_id, seat_id));

        let (code, version): (i64, i64) = self
            .cas
            .key(seat_key(event_id, seat_id))
            .key(HOLD_INDEX_KEY)
            .arg(expected_version)
            .arg(next.status().as_str())
            .arg(next.holder_token().map(HolderToken::as_str).unwrap_or(""))
            .arg(expires_ms.unwrap_or_default())
            .arg(member.unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match code {
            0 => Ok(version as u64),
            1 => Err(StoreError::conflict(event_id, seat_id, expected_version, version as u64)),
            _ => Err(StoreError::not_found(event_id, seat_id)),
        }
    }

    async fn scan_expired_page(
        &self,
        now: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> StoreResult<ExpiredPage> {
        let mut conn = self.conn.clone();
        let min = match cursor {
            Some(cursor) => format!("({}", cursor.0),
            None => "-".to_string(),
        };
        // Everything that sorts before the first millisecond after `now`.
        let max = format!("({:020}", now.timestamp_millis().max(0) + 1);

        let members: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(HOLD_INDEX_KEY)
            .arg(&min)
            .arg(&max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit + 1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let has_more = members.len() > limit;
        let page = &members[..members.len().min(limit)];

        let mut records = Vec::with_capacity(page.len());
        for member in page {
            let Some((event_id, seat_id)) = parse_hold_member(member) else {
                continue;
            };
            match self.get(&event_id, &seat_id).await {
                Ok(record) if record.is_expired_hold(now) => records.push(record),
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let next = match page.last() {
            Some(last) if has_more => Some(ScanCursor(last.clone())),
            _ => None,
        };
        Ok(ExpiredPage { records, next })
    }

    async fn list(&self, event_id: &EventId) -> StoreResult<Vec<SeatRecord>> {
        let mut conn = self.conn.clone();
        let seat_ids: Vec<String> = conn.zrange(event_index_key(event_id), 0, -1).await.map_err(unavailable)?;
        if seat_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for seat_id in &seat_ids {
            pipe.hgetall(seat_key(event_id, &SeatId::new(seat_id.as_str())));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await.map_err(unavailable)?;

        seat_ids
            .into_iter()
            .zip(hashes)
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(seat_id, fields)| record_from_hash(event_id, &SeatId::new(seat_id), fields))
            .collect()
    }

    async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let mut inserted = 0;
        for seat in seats {
            let created: i64 = self
                .provision
                .key(seat_key(event_id, &seat.seat_id))
                .key(event_index_key(event_id))
                .arg(seat.seat_id.as_str())
                .arg(seat.section.as_deref().unwrap_or(""))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            inserted += created as usize;
        }
        info!("Provisioned {} new seat(s) for event {}", inserted, event_id);
        Ok(inserted)
    }
}

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use seatmap_core::{NewSeat, OutcomeCode, SeatMap, SeatOutcome};
use seatmap_shared::{EventId, HolderToken, SeatId, SeatStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SeatBatchRequest {
    pub seat_ids: Vec<SeatId>,
    pub holder_token: HolderToken,
    /// Hold length for reserve/extend/lock. Ignored by release and confirm.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SeatResult {
    pub seat_id: SeatId,
    pub outcome: OutcomeCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SeatStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl From<SeatOutcome> for SeatResult {
    fn from(outcome: SeatOutcome) -> Self {
        Self {
            seat_id: outcome.seat_id,
            outcome: outcome.code,
            status: outcome.status,
            expires_at: outcome.expires_at,
            version: outcome.version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeatBatchResponse {
    pub event_id: EventId,
    pub results: Vec<SeatResult>,
}

#[derive(Debug, Serialize)]
pub struct SeatView {
    pub seat_id: SeatId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub status: SeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Debug, Serialize)]
pub struct SectionSummary {
    pub total_seats: usize,
    pub available_seats: usize,
}

#[derive(Debug, Serialize)]
pub struct SeatMapResponse {
    pub event_id: EventId,
    pub total_seats: usize,
    pub available_seats: usize,
    pub sections: BTreeMap<String, SectionSummary>,
    pub seats: Vec<SeatView>,
}

impl From<SeatMap> for SeatMapResponse {
    fn from(map: SeatMap) -> Self {
        Self {
            event_id: map.event_id,
            total_seats: map.total,
            available_seats: map.available,
            sections: map
                .sections
                .into_iter()
                .map(|(name, counts)| {
                    (
                        name,
                        SectionSummary {
                            total_seats: counts.total,
                            available_seats: counts.available,
                        },
                    )
                })
                .collect(),
            seats: map
                .seats
                .into_iter()
                .map(|seat| SeatView {
                    seat_id: seat.seat_id,
                    section: seat.section,
                    status: seat.status,
                    expires_at: seat.expires_at,
                    version: seat.version,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProvisionSeat {
    pub seat_id: SeatId,
    #[serde(default)]
    pub section: Option<String>,
}

/// A block of `rows` x `seats_per_row` seats named `A1`, `A2`, ...
#[derive(Debug, Deserialize)]
pub struct GridLayout {
    #[serde(default)]
    pub section: Option<String>,
    pub rows: u32,
    pub seats_per_row: u32,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub seats: Vec<ProvisionSeat>,
    #[serde(default)]
    pub grids: Vec<GridLayout>,
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub event_id: EventId,
    pub requested: usize,
    pub inserted: usize,
}

const MAX_PROVISION_BATCH: usize = 10_000;

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/events/{event_id}/seats", post(provision_seats).get(get_seat_map))
        .route("/v1/events/{event_id}/seats/reserve", post(reserve_seats))
        .route("/v1/events/{event_id}/seats/extend", post(extend_seats))
        .route("/v1/events/{event_id}/seats/lock", post(lock_seats))
        .route("/v1/events/{event_id}/seats/release", post(release_seats))
        .route("/v1/events/{event_id}/seats/confirm", post(confirm_seats))
}

fn validate_event_id(event_id: String) -> Result<EventId, AppError> {
    let event_id = EventId::new(event_id);
    if !event_id.is_well_formed() {
        return Err(AppError::Validation(
            "event_id must not be blank or contain control characters".into(),
        ));
    }
    Ok(event_id)
}

fn validate_batch(event_id: String, req: &SeatBatchRequest) -> Result<EventId, AppError> {
    let event_id = validate_event_id(event_id)?;
    if req.seat_ids.is_empty() {
        return Err(AppError::Validation("seat_ids must not be empty".into()));
    }
    if !req.seat_ids.iter().all(SeatId::is_well_formed) {
        return Err(AppError::Validation(
            "seat_ids must not be blank or contain control characters".into(),
        ));
    }
    if req.holder_token.is_empty() {
        return Err(AppError::Validation("holder_token must not be empty".into()));
    }
    Ok(event_id)
}

fn requested_ttl(state: &AppState, ttl_seconds: Option<u64>) -> Result<Option<chrono::Duration>, AppError> {
    match ttl_seconds {
        None => Ok(None),
        Some(secs) => {
            let max = state.limits.max_ttl.num_seconds();
            if secs == 0 || secs > max as u64 {
                return Err(AppError::Validation(format!(
                    "ttl_seconds must be between 1 and {}",
                    max
                )));
            }
            Ok(Some(chrono::Duration::seconds(secs as i64)))
        }
    }
}

fn batch_response(
    state: &AppState,
    operation: &str,
    event_id: EventId,
    outcomes: Vec<SeatOutcome>,
) -> (StatusCode, Json<SeatBatchResponse>) {
    state.metrics.record_outcomes(operation, &outcomes);

    let status = if outcomes.iter().any(|o| o.code == OutcomeCode::StoreUnavailable) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(SeatBatchResponse {
            event_id,
            results: outcomes.into_iter().map(SeatResult::from).collect(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/events/{event_id}/seats/reserve
pub async fn reserve_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<SeatBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SeatBatchResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_batch(event_id, &req)?;
    let ttl = requested_ttl(&state, req.ttl_seconds)?.unwrap_or(state.limits.default_ttl);

    let outcomes = state
        .manager
        .reserve(&event_id, &req.seat_ids, &req.holder_token, ttl)
        .await;
    Ok(batch_response(&state, "reserve", event_id, outcomes))
}

/// POST /v1/events/{event_id}/seats/extend
pub async fn extend_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<SeatBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SeatBatchResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_batch(event_id, &req)?;
    let ttl = requested_ttl(&state, req.ttl_seconds)?.unwrap_or(state.limits.default_ttl);

    let outcomes = state
        .manager
        .extend(&event_id, &req.seat_ids, &req.holder_token, ttl)
        .await;
    Ok(batch_response(&state, "extend", event_id, outcomes))
}

/// POST /v1/events/{event_id}/seats/lock
///
/// Without `ttl_seconds` the hold keeps its current deadline.
pub async fn lock_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<SeatBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SeatBatchResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_batch(event_id, &req)?;
    let ttl = requested_ttl(&state, req.ttl_seconds)?;

    let outcomes = state
        .manager
        .lock(&event_id, &req.seat_ids, &req.holder_token, ttl)
        .await;
    Ok(batch_response(&state, "lock", event_id, outcomes))
}

/// POST /v1/events/{event_id}/seats/release
pub async fn release_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<SeatBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SeatBatchResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_batch(event_id, &req)?;

    let outcomes = state
        .manager
        .release(&event_id, &req.seat_ids, &req.holder_token)
        .await;
    Ok(batch_response(&state, "release", event_id, outcomes))
}

/// POST /v1/events/{event_id}/seats/confirm
pub async fn confirm_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<SeatBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SeatBatchResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_batch(event_id, &req)?;

    let outcomes = state
        .manager
        .confirm_sale(&event_id, &req.seat_ids, &req.holder_token)
        .await;
    Ok(batch_response(&state, "confirm_sale", event_id, outcomes))
}

/// GET /v1/events/{event_id}/seats
pub async fn get_seat_map(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<SeatMapResponse>, AppError> {
    let event_id = EventId::new(event_id);
    let now = state.manager.clock().now();

    let map = SeatMap::load(state.manager.store().as_ref(), &event_id, now)
        .await
        .map_err(AppError::from_store)?;

    if map.total == 0 {
        return Err(AppError::NotFound(format!("No seats for event {}", event_id)));
    }
    Ok(Json(SeatMapResponse::from(map)))
}

/// POST /v1/events/{event_id}/seats
///
/// Creates seats that do not exist yet; existing seats are untouched.
pub async fn provision_seats(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionResponse>), AppError> {
    let Json(req) = payload?;
    let event_id = validate_event_id(event_id)?;
    let mut seats: Vec<NewSeat> = req
        .seats
        .into_iter()
        .map(|seat| NewSeat {
            seat_id: seat.seat_id,
            section: seat.section,
        })
        .collect();
    for grid in &req.grids {
        let size = (grid.rows as usize).saturating_mul(grid.seats_per_row as usize);
        if size > MAX_PROVISION_BATCH {
            return Err(AppError::Validation(format!(
                "at most {} seats per request",
                MAX_PROVISION_BATCH
            )));
        }
        seats.extend(NewSeat::grid(grid.section.as_deref(), grid.rows, grid.seats_per_row));
    }

    if seats.is_empty() {
        return Err(AppError::Validation("no seats to provision".into()));
    }
    if seats.len() > MAX_PROVISION_BATCH {
        return Err(AppError::Validation(format!(
            "at most {} seats per request",
            MAX_PROVISION_BATCH
        )));
    }
    if !seats.iter().all(|s| s.seat_id.is_well_formed()) {
        return Err(AppError::Validation(
            "seat ids must not be blank or contain control characters".into(),
        ));
    }

    let inserted = state
        .manager
        .provision(&event_id, &seats)
        .await
        .map_err(AppError::from_store)?;

    let status = if inserted > 0 { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(ProvisionResponse {
            event_id,
            requested: seats.len(),
            inserted,
        }),
    ))
}

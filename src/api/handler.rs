use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;

use crate::api::middleware::verify_identity::AuthedUser;
use crate::api::server::{AppState, JsonResult, RouteError};
use crate::clock::DayId;
use crate::db::prelude::*;
use crate::engine::ledger::ConversionOutcome;
use crate::engine::scheduler::TickReport;
use crate::engine::view::{DrawView, EngageView, PointsView, TodayView};

#[derive(Debug, Deserialize)]
pub struct EngageBody {
    pub event_type: ActivityKind,
}

#[derive(Debug, Deserialize)]
pub struct ConvertBody {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct StaticCreditBody {
    pub user_id: UserId,
    pub amount: i64,
    pub source: StaticSource,
}

fn parse_day(raw: &str) -> Result<DayId, RouteError> {
    raw.parse().map_err(|_| RouteError::InvalidDay(raw.to_string()))
}

#[instrument(skip(state))]
pub async fn today(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> JsonResult<TodayView> {
    Ok(Json(state.engine.today(&user, Utc::now()).await?))
}

#[instrument(skip(state))]
pub async fn engage(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<EngageBody>,
) -> JsonResult<EngageView> {
    Ok(Json(
        state
            .engine
            .engage(&user, body.event_type, Utc::now())
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn today_draw(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> JsonResult<DrawView> {
    Ok(Json(state.engine.today_draw(&user, Utc::now()).await?))
}

#[instrument(skip(state))]
pub async fn points(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> JsonResult<PointsView> {
    Ok(Json(state.engine.points(&user, Utc::now()).await?))
}

#[instrument(skip(state))]
pub async fn convert(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(body): Json<ConvertBody>,
) -> JsonResult<ConversionOutcome> {
    Ok(Json(
        state.engine.convert(&user, body.amount, Utc::now()).await?,
    ))
}

#[instrument(skip(state))]
pub async fn draw_by_day(
    State(state): State<Arc<AppState>>,
    Path(day): Path<String>,
) -> JsonResult<DrawView> {
    let day_id = parse_day(&day)?;
    match state.engine.draw_view(day_id).await? {
        Some(draw) => Ok(Json(draw)),
        None => Err(RouteError::NotFound(day)),
    }
}

#[instrument(skip(state))]
pub async fn leaderboard_by_day(
    State(state): State<Arc<AppState>>,
    Path(day): Path<String>,
) -> JsonResult<LeaderboardSnapshot> {
    let day_id = parse_day(&day)?;
    match state.engine.leaderboard(day_id).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(RouteError::NotFound(day)),
    }
}

#[instrument(skip(state))]
pub async fn trigger_rollover(State(state): State<Arc<AppState>>) -> JsonResult<TickReport> {
    tracing::info!("rollover triggered manually");
    Ok(Json(state.engine.scheduler().tick(Utc::now()).await?))
}

#[instrument(skip(state))]
pub async fn static_credit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StaticCreditBody>,
) -> JsonResult<PointsAccount> {
    Ok(Json(
        state
            .engine
            .ledger
            .credit_static(&body.user_id, body.amount, body.source, Utc::now())
            .await?,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2025-06-01").unwrap().to_string(), "2025-06-01");
        assert!(matches!(parse_day("06/01/2025"), Err(RouteError::InvalidDay(_))));
    }
}

//! Widget rendering endpoints for the layout renderer.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::widget::RenderedWidget;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/widgets/{name}", get(render_widget))
        .route("/slots/{slot}", get(render_slot))
}

/// JSON-encoded query parameters.
#[derive(Debug, Default, Deserialize)]
struct RenderParams {
    config: Option<String>,
    data: Option<String>,
}

fn parse_json(field: &str, raw: Option<&str>) -> AppResult<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AppError::BadRequest(format!("{field} must be JSON: {e}"))),
    }
}

async fn render_widget(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RenderParams>,
) -> AppResult<Json<RenderedWidget>> {
    let overrides = match parse_json("config", params.config.as_deref())? {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        _ => return Err(AppError::BadRequest("config must be a JSON object".into())),
    };
    let slot_data = parse_json("data", params.data.as_deref())?;

    state
        .widgets()
        .render(&name, overrides, slot_data)
        .await
        .map(Json)
        .ok_or(AppError::NotFound)
}

async fn render_slot(
    State(state): State<AppState>,
    Path(slot): Path<String>,
    Query(params): Query<RenderParams>,
) -> AppResult<Json<Vec<RenderedWidget>>> {
    let slot_data = parse_json("data", params.data.as_deref())?;
    Ok(Json(state.widgets().render_slot(&slot, slot_data).await))
}

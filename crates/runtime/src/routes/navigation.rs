//! Navigation entries contributed by plugin manifests.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::AppResult;
use crate::plugin::NavigationItem;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/navigation", get(navigation))
}

async fn navigation(State(state): State<AppState>) -> AppResult<Json<Vec<NavigationItem>>> {
    Ok(Json(state.runtime().navigation().await?))
}

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use berth_core::{ContainerInfo, ContainerSpec, ContainerStatus, ContainerSummary};
use tracing::instrument;

use crate::app::{ApiError, AppState};

#[instrument(skip_all)]
pub async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerSummary>> {
    Json(state.manager.list_containers())
}

#[instrument(skip_all)]
pub async fn create_container(
    State(state): State<AppState>,
    Json(spec): Json<ContainerSpec>,
) -> Result<(StatusCode, Json<ContainerInfo>), ApiError> {
    let info = state.manager.create_container(spec)?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[instrument(skip_all)]
pub async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(state.manager.container(&id)?))
}

#[instrument(skip_all)]
pub async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.remove_container(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all)]
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerStatus>, ApiError> {
    Ok(Json(state.manager.start_container(&id).await?))
}

use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::auth::Owner;
use crate::error::UploadError;
use crate::models::SweepReport;
use axum::{Extension, Json, extract::State};

#[utoipa::path(
    post,
    path = "/uploads/cleanup",
    responses(
        (status = 200, description = "Idle staging directories of the caller removed", body = SweepReport),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn cleanup_idle(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Json<SweepReport>, AppError> {
    let owner_id = owner.id().ok_or(UploadError::Unauthorized)?;
    let report = state.garbage_collector().sweep_idle(owner_id).await?;
    Ok(Json(report))
}

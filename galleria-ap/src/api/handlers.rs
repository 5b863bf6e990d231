//! HTTP request handlers

use crate::api::AppState;
use crate::catalog::SegmentInfo;
use crate::error::Error;
use axum::{extract::State, http::StatusCode, Json};
use galleria_common::{GalleryId, PlaybackCommand, PlaybackStatus};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct PlaybackStatusResponse {
    playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<PlaybackStatus>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    galleries: Vec<GalleryId>,
    finished: usize,
    total: usize,
    segments: Vec<SegmentInfo>,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn error_response(err: Error) -> ApiError {
    let code = match &err {
        Error::UnknownSegment(_) | Error::UnknownGallery(_) => StatusCode::NOT_FOUND,
        Error::SegmentNotReady(_) => StatusCode::CONFLICT,
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::Common(galleria_common::Error::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    }
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", err),
        }),
    )
}

/// GET /playback/status - status sampled at the current sink time
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<PlaybackStatusResponse>, ApiError> {
    let status = state.handle.current_status().await.map_err(error_response)?;
    Ok(Json(PlaybackStatusResponse {
        playing: status.is_some(),
        status,
    }))
}

/// POST /playback/command - iteration or gallery switch
///
/// Returns 202 once the scheduler accepts the request; the switch lands
/// after decoding.
pub async fn post_command(
    State(state): State<AppState>,
    Json(command): Json<PlaybackCommand>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    info!("Command request: {:?}", command);
    state
        .handle
        .dispatch(command)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "accepted".to_string(),
        }),
    ))
}

/// GET /catalog
pub async fn get_catalog(State(state): State<AppState>) -> Json<CatalogResponse> {
    let catalog = &state.catalog;
    Json(CatalogResponse {
        galleries: catalog.galleries(),
        finished: catalog.finished_count(),
        total: catalog.len(),
        segments: catalog.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleria_common::SegmentKey;

    #[test]
    fn test_error_status_codes() {
        let key = SegmentKey::new("study", 3);
        assert_eq!(
            error_response(Error::UnknownSegment(key.clone())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(Error::UnknownGallery("void".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(Error::SegmentNotReady(key)).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(Error::BadRequest("nope".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(Error::EngineStopped).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

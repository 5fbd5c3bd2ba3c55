//! Prediction endpoint
//!
//! Accepts a multipart upload, rejects anything that is not declared as an
//! image, and runs the pipeline on the blocking pool.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use cardamom_cam::inference::{check_content_type, PipelineError, PredictionResponse};
use cardamom_cam::utils::{CardamomError, ErrorKind};

use crate::state::SharedState;

/// Name of the multipart field carrying the image
pub const UPLOAD_FIELD: &str = "file";

/// Error body, `{ "detail": ... }`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// An error ready to be sent to the client
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Error processing image".to_string(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Client => StatusCode::BAD_REQUEST,
        ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CardamomError> for ApiError {
    fn from(err: CardamomError) -> Self {
        Self {
            status: status_for(err.kind()),
            detail: err.public_detail(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self {
            status: status_for(err.kind()),
            detail: err.public_detail(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { detail: self.detail })).into_response()
    }
}

/// POST /predict - Classify an uploaded leaf image and explain the result
pub async fn predict(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>, ApiError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
        upload = Some((content_type, bytes.to_vec()));
        break;
    }

    let (content_type, bytes) = upload
        .ok_or_else(|| ApiError::bad_request(format!("Missing '{}' field", UPLOAD_FIELD)))?;

    predict_upload(state, content_type, bytes).await.map(Json)
}

/// Everything below the multipart extractor
pub async fn predict_upload(
    state: SharedState,
    content_type: Option<String>,
    bytes: Vec<u8>,
) -> Result<PredictionResponse, ApiError> {
    // rejected here, before the pipeline is scheduled
    check_content_type(content_type.as_deref())?;

    info!(
        "Prediction request: {} bytes ({})",
        bytes.len(),
        content_type.as_deref().unwrap_or("unknown")
    );

    let result = tokio::task::spawn_blocking(move || {
        state.pipeline.run_bytes(content_type.as_deref(), &bytes)
    })
    .await
    .map_err(|e| {
        error!("Prediction task did not complete: {}", e);
        ApiError::internal()
    })?;

    Ok(result?)
}

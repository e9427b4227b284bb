use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::matcher::{CompareRequest, MatchResult};
use crate::state::AppState;

/// Multipart field carrying the uploaded image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// `GET /`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `POST /extract-embedding`
///
/// Reads the `image` field of a multipart upload and returns the embedding of
/// the first face in it. Other fields are ignored.
pub async fn extract_embedding(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<EmbeddingResponse>> {
    let mut multipart = multipart?;

    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            image = Some(field.bytes().await?);
            break;
        }
    }
    let Some(bytes) = image else {
        return Err(ApiError::BadRequest("No image uploaded".to_string()));
    };
    log::debug!("received {} byte image", bytes.len());

    let embedding = state.extractor.extract(bytes, state.extract_timeout).await?;
    Ok(Json(EmbeddingResponse { embedding }))
}

/// `POST /compare-embedding`
pub async fn compare_embedding(
    State(state): State<AppState>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> ApiResult<Json<MatchResult>> {
    let Json(request) = payload?;
    let result = request.evaluate(state.default_threshold)?;
    log::debug!(
        "compared against {} candidates: idx={} score={} match={}",
        request.existing_embeddings.len(),
        result.best_index,
        result.best_score,
        result.matched
    );
    Ok(Json(result))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

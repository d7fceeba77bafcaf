//! HTTP surface: `AppState`, bearer-token extraction, and the axum router
//! wiring the external interface table onto the chest engine.

mod chest;
mod retrieve;

use crate::chest::ChestEngine;
use crate::config::Config;
use crate::error::{Error, Result};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

pub struct AppState {
    pub engine: ChestEngine,
    pub config: Config,
}

/// Pulls a bearer token out of the `Authorization` header. The download
/// handler additionally accepts a `?token=` query parameter and
/// does its own extraction rather than calling this helper.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized {
            reason: "missing Authorization header".to_string(),
        })?;
    crate::token::bearer_from_header(value).ok_or_else(|| Error::Unauthorized {
        reason: "Authorization header must carry a Bearer token".to_string(),
    })
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub require_totp: bool,
}

/// Public, unauthenticated admission policy.
#[utoipa::path(
    get,
    path = "/config",
    responses((status = 200, description = "Admission policy", body = ConfigResponse)),
    tag = "chest"
)]
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        require_totp: state.engine.require_totp(),
    })
}

#[derive(OpenApi)]
#[openapi(
    components(schemas(
        ConfigResponse,
        chest::CreateChestRequest,
        chest::CreateChestResponse,
        chest::UploadedFileDto,
        chest::UploadFilesResponse,
        chest::CreateMultipartRequest,
        chest::CreateMultipartResponse,
        chest::PartResponse,
        chest::CompletedPartDto,
        chest::CompleteMultipartRequest,
        chest::CompleteMultipartResponse,
        chest::SealChestRequest,
        chest::SealChestResponse,
        retrieve::RetrievedFileDto,
        retrieve::RetrieveResponse,
    )),
    tags(
        (name = "chest", description = "Chest lifecycle endpoints"),
        (name = "retrieve", description = "Retrieval and download endpoints")
    )
)]
pub struct ApiDoc;

pub fn create_api_router(state: Arc<AppState>) -> OpenApiRouter {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(get_config))
        .routes(routes!(chest::create_chest))
        .routes(routes!(chest::upload_files))
        .routes(routes!(chest::create_multipart_upload))
        .routes(routes!(chest::upload_part))
        .routes(routes!(chest::complete_multipart))
        .routes(routes!(chest::seal_chest))
        .routes(routes!(retrieve::retrieve_by_code))
        .routes(routes!(retrieve::download_file))
        .with_state(state)
}

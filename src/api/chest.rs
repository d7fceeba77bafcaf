//! Handlers for the upload-side endpoints: create a chest, push files into
//! it (single-request or chunked), and seal it for retrieval.

use super::{bearer_token, AppState};
use crate::chest::UploadItem;
use crate::error::{Error, Result};
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateChestRequest {
    #[serde(default)]
    pub totp_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateChestResponse {
    pub session_id: Uuid,
    pub upload_token: String,
    pub expires_in: i64,
}

/// Creates a new chest session, admitting via TOTP when `requireTOTP` is configured.
#[utoipa::path(
    post,
    path = "/chest",
    request_body = CreateChestRequest,
    responses(
        (status = 201, description = "Chest created", body = CreateChestResponse),
        (status = 401, description = "TOTP required or invalid")
    ),
    tag = "chest"
)]
pub async fn create_chest(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateChestRequest>>,
) -> Result<(StatusCode, Json<CreateChestResponse>)> {
    let totp_token = body.and_then(|Json(b)| b.totp_token);
    let created = state.engine.create_chest(totp_token.as_deref()).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateChestResponse {
            session_id: created.session_id,
            upload_token: created.upload_token,
            expires_in: created.expires_in,
        }),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFileDto {
    pub file_id: Uuid,
    pub filename: String,
    pub is_text: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadFilesResponse {
    pub uploaded_files: Vec<UploadedFileDto>,
}

#[derive(Deserialize)]
struct TextItem {
    content: String,
    #[serde(default)]
    filename: Option<String>,
}

/// Accepts a multipart form with `files` parts and JSON `textItems` parts.
#[utoipa::path(
    post,
    path = "/chest/{sid}/upload",
    params(("sid" = Uuid, Path, description = "Chest session id")),
    responses(
        (status = 201, description = "Files stored", body = UploadFilesResponse),
        (status = 400, description = "Empty or malformed multipart body")
    ),
    tag = "chest"
)]
pub async fn upload_files(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadFilesResponse>)> {
    let token = bearer_token(&headers)?;

    let mut items = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
        msg: format!("malformed multipart body: {e}"),
    })? {
        match field.name().unwrap_or("") {
            "files" => {
                let filename = field.file_name().map(str::to_string);
                let mime_type = field.content_type().map(str::to_string);
                let content = field.bytes().await.map_err(|e| Error::BadRequest {
                    msg: format!("failed to read file part: {e}"),
                })?;
                items.push(UploadItem {
                    is_text: false,
                    filename,
                    mime_type,
                    content,
                });
            }
            "textItems" => {
                let raw = field.bytes().await.map_err(|e| Error::BadRequest {
                    msg: format!("failed to read textItems part: {e}"),
                })?;
                let text: TextItem = serde_json::from_slice(&raw).map_err(|e| Error::BadRequest {
                    msg: format!("invalid textItems JSON: {e}"),
                })?;
                items.push(UploadItem {
                    is_text: true,
                    filename: text.filename,
                    mime_type: None,
                    content: Bytes::from(text.content.into_bytes()),
                });
            }
            _ => {}
        }
    }

    if items.is_empty() {
        return Err(Error::BadRequest {
            msg: "multipart body must include at least one files or textItems part".to_string(),
        });
    }

    let uploaded = state.engine.upload_files(session_id, token, items).await?;
    let uploaded_files = uploaded
        .into_iter()
        .map(|f| UploadedFileDto {
            file_id: f.file_id,
            filename: f.filename,
            is_text: f.is_text,
        })
        .collect();

    Ok((StatusCode::CREATED, Json(UploadFilesResponse { uploaded_files })))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultipartRequest {
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultipartResponse {
    pub file_id: Uuid,
    pub upload_id: String,
}

/// Starts a chunked upload; the returned `uploadId` is itself a signed token.
#[utoipa::path(
    post,
    path = "/chest/{sid}/multipart/create",
    params(("sid" = Uuid, Path, description = "Chest session id")),
    request_body = CreateMultipartRequest,
    responses((status = 201, description = "Multipart upload created", body = CreateMultipartResponse)),
    tag = "chest"
)]
pub async fn create_multipart_upload(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CreateMultipartRequest>,
) -> Result<(StatusCode, Json<CreateMultipartResponse>)> {
    let token = bearer_token(&headers)?;
    let created = state
        .engine
        .create_multipart_upload(session_id, token, body.filename, body.mime_type, body.file_size)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMultipartResponse {
            file_id: created.file_id,
            upload_id: created.multipart_token,
        }),
    ))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartResponse {
    pub etag: String,
    pub part_number: u32,
}

/// Stores one chunk. Raw body, bearer is the multipart token.
#[utoipa::path(
    put,
    path = "/chest/{sid}/multipart/{fid}/part/{n}",
    params(
        ("sid" = Uuid, Path),
        ("fid" = Uuid, Path),
        ("n" = u32, Path, description = "1-based part number")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses((status = 200, description = "Part stored", body = PartResponse)),
    tag = "chest"
)]
pub async fn upload_part(
    State(state): State<Arc<AppState>>,
    Path((session_id, file_id, part_number)): Path<(Uuid, Uuid, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PartResponse>> {
    let token = bearer_token(&headers)?;
    let uploaded = state
        .engine
        .upload_part(session_id, file_id, part_number, token, body)
        .await?;

    Ok(Json(PartResponse {
        etag: uploaded.etag,
        part_number: uploaded.part_number,
    }))
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPartDto {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    pub parts: Vec<CompletedPartDto>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartResponse {
    pub file_id: Uuid,
    pub filename: String,
}

/// Assembles the uploaded parts into the final file.
#[utoipa::path(
    post,
    path = "/chest/{sid}/multipart/{fid}/complete",
    params(("sid" = Uuid, Path), ("fid" = Uuid, Path)),
    request_body = CompleteMultipartRequest,
    responses((status = 200, description = "File assembled", body = CompleteMultipartResponse)),
    tag = "chest"
)]
pub async fn complete_multipart(
    State(state): State<Arc<AppState>>,
    Path((session_id, file_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<CompleteMultipartRequest>,
) -> Result<Json<CompleteMultipartResponse>> {
    let token = bearer_token(&headers)?;
    let parts = body
        .parts
        .into_iter()
        .map(|p| (p.part_number, p.etag))
        .collect();
    let completed = state
        .engine
        .complete_multipart(session_id, file_id, token, parts)
        .await?;

    Ok(Json(CompleteMultipartResponse {
        file_id: completed.file_id,
        filename: completed.filename,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SealChestRequest {
    pub file_ids: Vec<Uuid>,
    pub validity_days: i32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SealChestResponse {
    pub retrieval_code: String,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Allocates a retrieval code and seals the chest against further uploads.
#[utoipa::path(
    post,
    path = "/chest/{sid}/complete",
    params(("sid" = Uuid, Path)),
    request_body = SealChestRequest,
    responses((status = 200, description = "Chest sealed", body = SealChestResponse)),
    tag = "chest"
)]
pub async fn seal_chest(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<SealChestRequest>,
) -> Result<Json<SealChestResponse>> {
    let token = bearer_token(&headers)?;
    let sealed = state
        .engine
        .seal_chest(session_id, token, body.file_ids, body.validity_days)
        .await?;

    Ok(Json(SealChestResponse {
        retrieval_code: sealed.retrieval_code,
        expiry_date: sealed.expiry_date,
    }))
}

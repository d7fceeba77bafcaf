//! Handlers for the read side: listing a sealed chest's contents by its
//! retrieval code, and streaming a single file back to the caller.

use super::AppState;
use crate::error::{Error, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedFileDto {
    pub file_id: Uuid,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub is_text: bool,
    pub file_extension: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveResponse {
    pub files: Vec<RetrievedFileDto>,
    pub chest_token: String,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Lists a sealed chest's files by its retrieval code.
#[utoipa::path(
    get,
    path = "/retrieve/{code}",
    params(("code" = String, Path, description = "6-character retrieval code")),
    responses(
        (status = 200, description = "Chest contents", body = RetrieveResponse),
        (status = 404, description = "Unknown or expired code")
    ),
    tag = "retrieve"
)]
pub async fn retrieve_by_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<RetrieveResponse>> {
    let retrieved = state.engine.retrieve_by_code(&code).await?;
    let files = retrieved
        .files
        .into_iter()
        .map(|f| RetrievedFileDto {
            file_id: f.file_id,
            filename: f.filename,
            size: f.size,
            mime_type: f.mime_type,
            is_text: f.is_text,
            file_extension: f.file_extension,
        })
        .collect();

    Ok(Json(RetrieveResponse {
        files,
        chest_token: retrieved.chest_token,
        expiry_date: retrieved.expiry_date,
    }))
}

/// Streams a single file back to the caller. Accepts the chest token from `Authorization: Bearer …`
/// or `?token=` (to support direct `<a download>` navigation).
#[utoipa::path(
    get,
    path = "/download/{fid}",
    params(
        ("fid" = Uuid, Path),
        ("token" = Option<String>, Query),
        ("filename" = Option<String>, Query, description = "Override the Content-Disposition filename")
    ),
    responses(
        (status = 200, description = "File bytes"),
        (status = 404, description = "File not found or chest expired")
    ),
    tag = "retrieve"
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = token_from_request(&headers, &params)?;
    let download = state.engine.prepare_download(file_id, &token).await?;

    let reader = state.engine.blob_store().get(&download.key).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let filename = params
        .get("filename")
        .cloned()
        .unwrap_or(download.filename);

    let mut response = (StatusCode::OK, body).into_response();
    let headers_mut = response.headers_mut();
    headers_mut.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&download.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers_mut.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&download.file_size.to_string())
            .expect("decimal digits are valid header value bytes"),
    );
    headers_mut.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&filename),
    );

    Ok(response)
}

fn token_from_request(headers: &HeaderMap, params: &HashMap<String, String>) -> Result<String> {
    if let Ok(token) = super::bearer_token(headers) {
        return Ok(token.to_string());
    }
    params.get("token").cloned().ok_or_else(|| Error::Unauthorized {
        reason: "missing chest token (Authorization header or ?token=)".to_string(),
    })
}

/// Builds `attachment; filename="…"; filename*=UTF-8''…` — the ASCII fallback
/// is quote-escaped, the RFC 5987 extended form percent-encodes everything
/// outside the unreserved set so neither can be used to inject headers or
/// break on non-ASCII names.
fn content_disposition(filename: &str) -> HeaderValue {
    let ascii_fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    let encoded = percent_encode_rfc5987(filename);

    let value = format!("attachment; filename=\"{ascii_fallback}\"; filename*=UTF-8''{encoded}");
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn percent_encode_rfc5987(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

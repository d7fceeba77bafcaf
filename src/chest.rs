//! The chest lifecycle engine: the heart of the service. Bridges the
//! metadata store and blob store behind the public operations the HTTP
//! layer calls, and enforces the state machine
//! `Open -> Sealed -> {Expired | Permanent} -> Reaped`.

use crate::blob::{BlobStore, Part as BlobPart};
use crate::db::{MetadataStore, NewFile};
use crate::error::{Error, Result};
use crate::ids;
use crate::token::TokenService;
use crate::totp::{self, TotpSecret};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

const MAX_COLLISION_RETRIES: u32 = 5;
const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Debug)]
pub struct CreatedChest {
    pub session_id: Uuid,
    pub upload_token: String,
    pub expires_in: i64,
}

pub struct UploadItem {
    pub is_text: bool,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub content: Bytes,
}

pub struct UploadedFile {
    pub file_id: Uuid,
    pub filename: String,
    pub is_text: bool,
}

pub struct CreatedMultipartUpload {
    pub file_id: Uuid,
    pub multipart_token: String,
}

#[derive(Debug)]
pub struct UploadedPart {
    pub etag: String,
    pub part_number: u32,
}

pub struct CompletedMultipartFile {
    pub file_id: Uuid,
    pub filename: String,
}

#[derive(Debug)]
pub struct SealedChest {
    pub retrieval_code: String,
    pub expiry_date: Option<DateTime<Utc>>,
}

pub struct RetrievedFile {
    pub file_id: Uuid,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub is_text: bool,
    pub file_extension: String,
}

#[derive(Debug)]
pub struct RetrievedChest {
    pub files: Vec<RetrievedFile>,
    pub chest_token: String,
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DownloadableFile {
    pub key: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size: i64,
}

pub struct ChestEngine {
    db: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    tokens: TokenService,
    require_totp: bool,
    totp_secrets: Vec<TotpSecret>,
}

impl ChestEngine {
    pub fn new(
        db: MetadataStore,
        blobs: Arc<dyn BlobStore>,
        tokens: TokenService,
        require_totp: bool,
        totp_secrets: Vec<TotpSecret>,
    ) -> Self {
        Self {
            db,
            blobs,
            tokens,
            require_totp,
            totp_secrets,
        }
    }

    pub fn require_totp(&self) -> bool {
        self.require_totp
    }

    /// (a) createChest
    pub async fn create_chest(&self, totp_code: Option<&str>) -> Result<CreatedChest> {
        if self.require_totp {
            let code = totp_code.ok_or(Error::TotpRequired)?;
            if totp::verify(&self.totp_secrets, code, Utc::now().timestamp()).is_none() {
                return Err(Error::InvalidTotp);
            }
        }

        let session_id = ids::new_session_id();
        self.db.insert_session(session_id).await?;
        let upload_token = self.tokens.mint_upload_token(session_id)?;

        Ok(CreatedChest {
            session_id,
            upload_token,
            expires_in: 86_400,
        })
    }

    async fn authorize_upload(&self, session_id: Uuid, upload_token: &str) -> Result<()> {
        let claims = self.tokens.verify_upload_token(upload_token)?;
        if claims.session_id != session_id {
            return Err(Error::Forbidden {
                reason: "upload token does not authorize this chest".to_string(),
            });
        }
        self.db
            .get_open_session(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(())
    }

    /// (b) uploadFiles
    pub async fn upload_files(
        &self,
        session_id: Uuid,
        upload_token: &str,
        items: Vec<UploadItem>,
    ) -> Result<Vec<UploadedFile>> {
        self.authorize_upload(session_id, upload_token).await?;

        let mut keys = Vec::with_capacity(items.len());
        let mut contents = Vec::with_capacity(items.len());
        let mut new_files = Vec::with_capacity(items.len());
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let file_id = ids::new_file_id();

            let (filename, mime_type, file_size) = if item.is_text {
                let filename = item
                    .filename
                    .unwrap_or_else(|| format!("text-{}.txt", Utc::now().timestamp_millis()));
                (filename, "text/plain".to_string(), item.content.len() as i64)
            } else {
                let filename = item.filename.unwrap_or_else(|| "unnamed-file".to_string());
                let mime_type = item
                    .mime_type
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let size = item.content.len() as i64;
                (filename, mime_type, size)
            };

            let extension = extension_of(&filename);

            keys.push(blob_key(session_id, file_id));
            contents.push(item.content);
            new_files.push(NewFile {
                id: file_id,
                session_id,
                original_filename: filename.clone(),
                mime_type,
                file_size,
                file_extension: extension,
                is_text: item.is_text,
            });
            results.push(UploadedFile {
                file_id,
                filename,
                is_text: item.is_text,
            });
        }

        // All blob puts run concurrently within the request; if any fails the
        // whole request fails; there is no server-side compensation for a partial write.
        let puts = keys
            .iter()
            .zip(contents.into_iter())
            .map(|(key, content)| self.blobs.put(key, content));
        futures::future::try_join_all(puts).await?;
        self.db.insert_files(&new_files).await?;

        Ok(results)
    }

    /// (c) createMultipartUpload
    pub async fn create_multipart_upload(
        &self,
        session_id: Uuid,
        upload_token: &str,
        filename: String,
        mime_type: String,
        file_size: u64,
    ) -> Result<CreatedMultipartUpload> {
        self.authorize_upload(session_id, upload_token).await?;

        if filename.trim().is_empty() || mime_type.trim().is_empty() || file_size == 0 {
            return Err(Error::BadRequest {
                msg: "filename, mimeType and a positive fileSize are required".to_string(),
            });
        }

        let file_id = ids::new_file_id();
        let key = blob_key(session_id, file_id);
        let upload_id = self.blobs.multipart_create(&key).await?;

        let multipart_token = self.tokens.mint_multipart_token(
            session_id,
            file_id,
            upload_id,
            filename,
            mime_type,
            file_size,
        )?;

        Ok(CreatedMultipartUpload {
            file_id,
            multipart_token,
        })
    }

    fn authorize_multipart(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        multipart_token: &str,
    ) -> Result<crate::token::MultipartClaims> {
        let claims = self.tokens.verify_multipart_token(multipart_token)?;
        if claims.session_id != session_id || claims.file_id != file_id {
            return Err(Error::Forbidden {
                reason: "multipart token does not authorize this file".to_string(),
            });
        }
        Ok(claims)
    }

    /// (d) uploadPart
    pub async fn upload_part(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        part_number: u32,
        multipart_token: &str,
        bytes: Bytes,
    ) -> Result<UploadedPart> {
        let claims = self.authorize_multipart(session_id, file_id, multipart_token)?;

        if part_number < 1 || part_number > MAX_PART_NUMBER {
            return Err(Error::BadRequest {
                msg: format!("part number must be in 1..={MAX_PART_NUMBER}"),
            });
        }
        if bytes.is_empty() {
            return Err(Error::BadRequest {
                msg: "part body must not be empty".to_string(),
            });
        }

        let key = blob_key(session_id, file_id);
        let etag = self
            .blobs
            .multipart_upload_part(&key, &claims.upload_id, part_number, bytes)
            .await?;

        Ok(UploadedPart { etag, part_number })
    }

    /// (e) completeMultipart
    pub async fn complete_multipart(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        multipart_token: &str,
        parts: Vec<(u32, String)>,
    ) -> Result<CompletedMultipartFile> {
        let claims = self.authorize_multipart(session_id, file_id, multipart_token)?;

        if parts.is_empty() {
            return Err(Error::BadRequest {
                msg: "parts must not be empty".to_string(),
            });
        }

        let mut sorted = parts;
        sorted.sort_by_key(|(n, _)| *n);
        let blob_parts: Vec<BlobPart> = sorted
            .into_iter()
            .map(|(part_number, etag)| BlobPart { part_number, etag })
            .collect();

        let key = blob_key(session_id, file_id);
        self.blobs
            .multipart_complete(&key, &claims.upload_id, &blob_parts)
            .await?;

        let extension = extension_of(&claims.filename);
        self.db
            .insert_file(&NewFile {
                id: file_id,
                session_id,
                original_filename: claims.filename.clone(),
                mime_type: claims.mime_type,
                file_size: claims.file_size as i64,
                file_extension: extension,
                is_text: false,
            })
            .await?;

        Ok(CompletedMultipartFile {
            file_id,
            filename: claims.filename,
        })
    }

    /// (f) sealChest
    pub async fn seal_chest(
        &self,
        session_id: Uuid,
        upload_token: &str,
        file_ids: Vec<Uuid>,
        validity_days: i32,
    ) -> Result<SealedChest> {
        self.authorize_upload(session_id, upload_token).await?;

        if !matches!(validity_days, 1 | 3 | 7 | 15 | -1) {
            return Err(Error::BadRequest {
                msg: format!("invalid validityDays: {validity_days}"),
            });
        }

        let count = self.db.count_session_files(session_id).await?;
        if count as usize != file_ids.len() {
            return Err(Error::BadRequest {
                msg: "submitted fileIds do not match the chest's current file set".to_string(),
            });
        }

        let expires_at = if validity_days == -1 {
            None
        } else {
            Some(Utc::now() + Duration::days(validity_days as i64))
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let code = ids::generate_retrieval_code();
            if self.db.retrieval_code_exists(&code).await? {
                if attempts >= MAX_COLLISION_RETRIES {
                    return Err(Error::CodeCollision);
                }
                continue;
            }

            let sealed = self.db.mark_sealed(session_id, &code, expires_at).await?;
            if !sealed {
                return Err(Error::AlreadySealed {
                    session_id: session_id.to_string(),
                });
            }

            return Ok(SealedChest {
                retrieval_code: code,
                expiry_date: expires_at,
            });
        }
    }

    /// (g) retrieveByCode
    pub async fn retrieve_by_code(&self, code: &str) -> Result<RetrievedChest> {
        if !ids::is_valid_retrieval_code(code) {
            return Err(Error::BadRequest {
                msg: "retrieval code must be 6 characters, A-Z and 0-9".to_string(),
            });
        }

        let now = Utc::now();
        let session = self
            .db
            .get_sealed_by_code(code, now)
            .await?
            .ok_or(Error::CodeNotFound)?;
        let session_id = session.session_id()?;

        let rows = self.db.list_session_files(session_id).await?;
        let files = rows
            .into_iter()
            .map(|row| -> Result<RetrievedFile> {
                Ok(RetrievedFile {
                    file_id: row.file_id()?,
                    filename: row.original_filename,
                    size: row.file_size,
                    mime_type: row.mime_type,
                    is_text: row.is_text,
                    file_extension: row.file_extension,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let chest_token = self.tokens.mint_chest_token(session_id, session.expires_at)?;

        Ok(RetrievedChest {
            files,
            chest_token,
            expiry_date: session.expires_at,
        })
    }

    /// (h) downloadFile
    pub async fn prepare_download(
        &self,
        file_id: Uuid,
        chest_token: &str,
    ) -> Result<DownloadableFile> {
        let claims = self.tokens.verify_chest_token(chest_token)?;

        let now = Utc::now();
        let row = self
            .db
            .get_downloadable_file(file_id, now)
            .await?
            .ok_or_else(|| Error::FileNotFound {
                file_id: file_id.to_string(),
            })?;
        let session_id = row.session_id()?;

        if claims.session_id != session_id {
            return Err(Error::Forbidden {
                reason: "chest token does not authorize this file".to_string(),
            });
        }

        Ok(DownloadableFile {
            key: blob_key(session_id, file_id),
            filename: row.original_filename,
            mime_type: row.mime_type,
            file_size: row.file_size,
        })
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.db
    }
}

fn blob_key(session_id: Uuid, file_id: Uuid) -> String {
    format!("{session_id}/{file_id}")
}

fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

//! Mints and verifies the three bearer-token kinds: upload, chest, multipart.
//!
//! The `type` field on every claims struct is a tagged discriminant the
//! verifier checks explicitly, so a structurally valid token of the wrong
//! kind fails with [`TokenError::WrongTokenType`] rather than being silently
//! accepted.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const UPLOAD_TOKEN_TTL_SECS: i64 = 24 * 3600;
const MULTIPART_TOKEN_TTL_SECS: i64 = 48 * 3600;
const PERMANENT_CHEST_TOKEN_TTL_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Display)]
pub enum TokenError {
    #[display("invalid token")]
    InvalidToken,
    #[display("expired token")]
    ExpiredToken,
    #[display("wrong token type")]
    WrongTokenType,
}

impl std::error::Error for TokenError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Upload,
    Chest,
    Multipart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadClaims {
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChestClaims {
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartClaims {
    pub session_id: Uuid,
    pub file_id: Uuid,
    pub upload_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies the three claim shapes against one process-wide HMAC key.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn mint_upload_token(&self, session_id: Uuid) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = UploadClaims {
            session_id,
            token_type: TokenType::Upload,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(UPLOAD_TOKEN_TTL_SECS)).timestamp(),
        };
        self.encode(&claims)
    }

    pub fn verify_upload_token(&self, token: &str) -> Result<UploadClaims, TokenError> {
        let claims: UploadClaims = self.decode(token)?;
        if claims.token_type != TokenType::Upload {
            return Err(TokenError::WrongTokenType);
        }
        Ok(claims)
    }

    /// `expires_at = None` mints a 365-day token for a permanent chest.
    pub fn mint_chest_token(
        &self,
        session_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let exp = expires_at
            .unwrap_or_else(|| now + Duration::seconds(PERMANENT_CHEST_TOKEN_TTL_SECS));
        let claims = ChestClaims {
            session_id,
            token_type: TokenType::Chest,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };
        self.encode(&claims)
    }

    pub fn verify_chest_token(&self, token: &str) -> Result<ChestClaims, TokenError> {
        let claims: ChestClaims = self.decode(token)?;
        if claims.token_type != TokenType::Chest {
            return Err(TokenError::WrongTokenType);
        }
        Ok(claims)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mint_multipart_token(
        &self,
        session_id: Uuid,
        file_id: Uuid,
        upload_id: String,
        filename: String,
        mime_type: String,
        file_size: u64,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = MultipartClaims {
            session_id,
            file_id,
            upload_id,
            filename,
            mime_type,
            file_size,
            token_type: TokenType::Multipart,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(MULTIPART_TOKEN_TTL_SECS)).timestamp(),
        };
        self.encode(&claims)
    }

    pub fn verify_multipart_token(&self, token: &str) -> Result<MultipartClaims, TokenError> {
        let claims: MultipartClaims = self.decode(token)?;
        if claims.token_type != TokenType::Multipart {
            return Err(TokenError::WrongTokenType);
        }
        Ok(claims)
    }

    fn encode<T: Serialize>(&self, claims: &T) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|_| TokenError::InvalidToken)
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, token: &str) -> Result<T, TokenError> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        jsonwebtoken::decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::ExpiredToken,
                _ => TokenError::InvalidToken,
            })
    }
}

/// Pulls a bearer token out of the `Authorization` header.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ")
}

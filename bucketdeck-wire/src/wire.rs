//! Encoding helpers shared by server and client

use bucketdeck_core::DeckError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid query string: {0}")]
    Query(String),

    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or malformed bearer token")]
    MissingToken,
}

impl From<WireError> for DeckError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::MissingToken => DeckError::Unauthenticated(err.to_string()),
            other => DeckError::InvalidInput(other.to_string()),
        }
    }
}

/// Decode a query string into `T`; an absent query decodes like an empty one
pub fn decode_query<T: DeserializeOwned>(query: Option<&str>) -> Result<T, WireError> {
    serde_urlencoded::from_str(query.unwrap_or("")).map_err(|e| WireError::Query(e.to_string()))
}

pub fn encode_query<T: Serialize>(value: &T) -> Result<String, WireError> {
    serde_urlencoded::to_string(value).map_err(|e| WireError::Query(e.to_string()))
}

pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(body)?)
}

/// Token of an `Authorization: Bearer <token>` header
pub fn bearer_token(header: Option<&str>) -> Result<&str, WireError> {
    let value = header.ok_or(WireError::MissingToken)?;
    let (scheme, token) = value.trim().split_once(' ').ok_or(WireError::MissingToken)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(WireError::MissingToken);
    }
    Ok(token)
}

/// `Content-Disposition` value forcing a download of `file_name`.
///
/// Carries an ASCII fallback in `filename` and the exact UTF-8 name in
/// `filename*` (RFC 5987).
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    )
}

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::error::ApiError;

pub const OWNER_HEADER: &str = "x-owner-id";

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(unauthorized("Invalid API key"));
    }

    Ok(())
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(unauthorized("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(unauthorized("Authorization must use Bearer token"));
    };

    Ok(token.to_string())
}

/// Verifies the API key and returns the calling user's id.
pub fn authorize(headers: &HeaderMap, expected_key: &str) -> Result<String, ApiError> {
    verify_bearer(headers, expected_key)?;
    owner_id(headers)
}

pub fn owner_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("Missing X-Owner-Id header".to_string()))
}

fn unauthorized(message: &str) -> ApiError {
    ApiError::Unauthorized(message.to_string())
}

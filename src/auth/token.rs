// Access token inspection
// Reads the expiry claim of a JWT-shaped token without verifying it

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// Decode the `exp` claim of a token.
///
/// Returns `None` if the token is not three dot-separated segments, the payload
/// is not base64url JSON, or `exp` is missing or not a number.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(secs, 0)
}

/// Check whether a token is expired or will expire within `safety_margin_secs`.
///
/// Malformed tokens are reported as expired.
pub fn is_expired(token: &str, safety_margin_secs: i64) -> bool {
    is_expired_at(token, safety_margin_secs, Utc::now())
}

fn is_expired_at(token: &str, safety_margin_secs: i64, now: DateTime<Utc>) -> bool {
    match expires_at(token) {
        None => true,
        Some(exp) => exp <= now + Duration::seconds(safety_margin_secs),
    }
}

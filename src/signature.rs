//! Request signing: canonical string construction and HMAC-SHA256.
//!
//! ```text
//! METHOD \n PATH \n sorted-query \n access-key \n timestamp \n nonce
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const ACCESS_KEY_HEADER: &str = "x-access-key";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const NONCE_HEADER: &str = "x-nonce";

/// Maximum allowed skew between the signed timestamp and server time.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Query pairs sorted by key then value, joined as `k=v&k=v`. A `signature`
/// query parameter never takes part in signing.
pub fn sorted_query(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> =
        pairs.iter().filter(|(k, _)| k != "signature").collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn canonical_string(
    method: &str,
    path: &str,
    query: &[(String, String)],
    access_key: &str,
    timestamp: &str,
    nonce: &str,
) -> String {
    [
        method.to_ascii_uppercase().as_str(),
        path,
        sorted_query(query).as_str(),
        access_key,
        timestamp,
        nonce,
    ]
    .join("\n")
}

/// Lowercase hex HMAC-SHA256 of `canonical` under `secret`.
pub fn sign(secret: &str, canonical: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(Error::internal)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
pub fn verify(secret: &str, canonical: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Parse a unix-seconds timestamp and reject it when outside the replay
/// window around `now`.
pub fn check_timestamp(now: i64, timestamp: &str) -> Result<i64> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| Error::Unauthorized("invalid timestamp".into()))?;
    match now.checked_sub(ts).map(i64::unsigned_abs) {
        Some(skew) if skew <= REPLAY_WINDOW_SECS.unsigned_abs() => Ok(ts),
        _ => Err(Error::Unauthorized("request expired".into())),
    }
}

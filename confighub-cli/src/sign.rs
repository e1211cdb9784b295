use std::process;

use axum::extract::Query;
use axum::http::Uri;
use chrono::Utc;
use confighub_lib::signature::{
    canonical_string, sign, ACCESS_KEY_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use rand::RngCore;

/// Headers a client must send for one signed call.
#[derive(Debug, PartialEq)]
struct SignedHeaders {
    timestamp: String,
    nonce: String,
    signature: String,
}

/// 128 random bits, hex encoded.
fn default_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sign_request(
    access_key: &str,
    secret: &str,
    method: &str,
    path_and_query: &str,
    timestamp: i64,
    nonce: &str,
) -> Result<SignedHeaders, String> {
    let uri: Uri = path_and_query
        .parse()
        .map_err(|e| format!("invalid path {}: {}", path_and_query, e))?;
    let query = Query::<Vec<(String, String)>>::try_from_uri(&uri)
        .map(|q| q.0)
        .map_err(|e| format!("invalid query string: {}", e))?;
    let timestamp = timestamp.to_string();
    let canonical = canonical_string(method, uri.path(), &query, access_key, &timestamp, nonce);
    let signature = sign(secret, &canonical).map_err(|e| e.to_string())?;
    Ok(SignedHeaders {
        timestamp,
        nonce: nonce.to_string(),
        signature,
    })
}

pub fn run_sign(
    access_key: &str,
    secret: &str,
    method: &str,
    path: &str,
    timestamp: Option<i64>,
    nonce: Option<String>,
) {
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let nonce = nonce.unwrap_or_else(default_nonce);
    match sign_request(access_key, secret, method, path, timestamp, &nonce) {
        Ok(headers) => {
            println!("{}: {}", ACCESS_KEY_HEADER, access_key);
            println!("{}: {}", TIMESTAMP_HEADER, headers.timestamp);
            println!("{}: {}", NONCE_HEADER, headers.nonce);
            println!("{}: {}", SIGNATURE_HEADER, headers.signature);
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use confighub_lib::signature::verify;

    use super::*;

    #[test]
    fn signs_path_and_sorted_query() {
        let headers = sign_request(
            "ak",
            "s3cret",
            "get",
            "/api/v1/config?name=db&env=prod",
            1_700_000_000,
            "abc",
        )
        .unwrap();
        let canonical = "GET\n/api/v1/config\nenv=prod&name=db\nak\n1700000000\nabc";
        assert!(verify("s3cret", canonical, &headers.signature));
        assert_eq!(headers.timestamp, "1700000000");
    }

    #[test]
    fn path_without_query() {
        let headers = sign_request("ak", "s3cret", "POST", "/api/v1/keys", 1, "n").unwrap();
        assert!(verify("s3cret", "POST\n/api/v1/keys\n\nak\n1\nn", &headers.signature));
    }

    #[test]
    fn default_nonces_are_random_hex() {
        let nonces: std::collections::HashSet<String> = (0..64).map(|_| default_nonce()).collect();
        assert_eq!(nonces.len(), 64);
        for nonce in &nonces {
            assert_eq!(nonce.len(), 32);
            assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}

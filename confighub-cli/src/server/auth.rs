use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use confighub_lib::gray::ip_matches;
use confighub_lib::signature::{
    canonical_string, check_timestamp, verify, ACCESS_KEY_HEADER, NONCE_HEADER,
    REPLAY_WINDOW_SECS, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use confighub_lib::{AccessKey, Capability, Error, Result};
use tracing::warn;

use super::metrics::metrics;
use super::routes::ApiError;
use super::state::AppState;
use super::store::ConfigStore;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// The authenticated principal of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub key: AccessKey,
    /// Identity used for gray bucketing.
    pub client_id: String,
    pub ip: Option<String>,
}

impl Caller {
    /// Name recorded as the author of writes.
    pub fn author(&self) -> &str {
        if self.key.name.is_empty() {
            &self.key.access_key
        } else {
            &self.key.name
        }
    }

    /// Check that this caller may use `capability` right now.
    pub fn authorize(&self, capability: Capability, now: DateTime<Utc>) -> Result<()> {
        if !self.key.active {
            return Err(Error::Forbidden("access key is deactivated".into()));
        }
        if self.key.is_expired(now) {
            return Err(Error::Forbidden("access key has expired".into()));
        }
        if !self.key.ip_whitelist.is_empty() {
            let allowed = self.ip.as_deref().is_some_and(|ip| {
                self.key
                    .ip_whitelist
                    .iter()
                    .any(|pattern| ip_matches(pattern, ip))
            });
            if !allowed {
                return Err(Error::Forbidden("caller address is not allow-listed".into()));
            }
        }
        if !self.key.permissions.allows(capability) {
            return Err(Error::Forbidden(format!("missing {} capability", capability)));
        }
        Ok(())
    }

    /// Documents from other projects do not exist for this caller.
    pub fn owns(&self, project: &str) -> bool {
        self.key.project == project
    }
}

/// The signing-relevant parts of an incoming request.
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    pub access_key: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

/// Verifies request signatures against the key registry and remembers
/// nonces for the replay window.
pub struct AccessGuard {
    store: Arc<dyn ConfigStore>,
    allow_unsigned: bool,
    trusted_proxies: Vec<String>,
    nonces: Mutex<HashMap<(String, String), i64>>,
}

impl AccessGuard {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        allow_unsigned: bool,
        trusted_proxies: Vec<String>,
    ) -> Self {
        Self {
            store,
            allow_unsigned,
            trusted_proxies,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and verify the access key of a request. `now` is unix seconds.
    pub async fn authenticate(&self, request: &SignedRequest<'_>, now: i64) -> Result<AccessKey> {
        let access_key = request
            .access_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing access key".into()))?;
        let key = self
            .store
            .get_access_key(access_key)
            .await?
            .ok_or_else(|| Error::Unauthorized("unknown access key".into()))?;

        let Some(signature) = request.signature else {
            if self.allow_unsigned {
                return Ok(key);
            }
            return Err(Error::Unauthorized("missing signature".into()));
        };

        let timestamp = request
            .timestamp
            .ok_or_else(|| Error::Unauthorized("missing timestamp".into()))?;
        check_timestamp(now, timestamp)?;

        let nonce = request.nonce.unwrap_or("");
        let canonical = canonical_string(
            request.method,
            request.path,
            request.query,
            access_key,
            timestamp,
            nonce,
        );
        if !verify(&key.secret, &canonical, signature) {
            return Err(Error::Unauthorized("signature mismatch".into()));
        }
        if !nonce.is_empty() {
            self.remember_nonce(access_key, nonce, now)?;
        }
        Ok(key)
    }

    fn remember_nonce(&self, access_key: &str, nonce: &str, now: i64) -> Result<()> {
        let mut seen = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, at| now - *at <= REPLAY_WINDOW_SECS);
        let slot = (access_key.to_string(), nonce.to_string());
        if seen.contains_key(&slot) {
            return Err(Error::Unauthorized("nonce already used".into()));
        }
        seen.insert(slot, now);
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The socket peer, unless the peer is a trusted proxy. Then it is the
/// nearest `X-Forwarded-For` hop that is not itself a trusted proxy.
fn caller_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[String],
) -> Option<String> {
    let peer = peer?.ip().to_string();
    let trusted = |ip: &str| trusted_proxies.iter().any(|p| ip_matches(p, ip));
    if !trusted(&peer) {
        return Some(peer);
    }

    let hops: Vec<&str> = header(headers, FORWARDED_FOR_HEADER)
        .map(|v| v.split(',').map(str::trim).filter(|h| !h.is_empty()).collect())
        .unwrap_or_default();
    let client = hops
        .iter()
        .rev()
        .find(|hop| !trusted(hop))
        .or(hops.first())
        .map(|hop| hop.to_string());
    client.or(Some(peer))
}

fn failure_reason(err: &Error) -> &'static str {
    match err {
        Error::Unauthorized(msg) if msg.contains("signature") => "bad_signature",
        Error::Unauthorized(msg) if msg.contains("nonce") => "replay",
        Error::Unauthorized(msg) if msg.contains("timestamp") => "timestamp",
        Error::Unauthorized(_) => "unknown_key",
        _ => "error",
    }
}

/// Axum middleware: authenticate the request and attach a [`Caller`].
pub async fn require_access_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let query = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map(|q| q.0)
        .unwrap_or_default();
    let signed = SignedRequest {
        method: request.method().as_str(),
        path: request.uri().path(),
        query: &query,
        access_key: header(headers, ACCESS_KEY_HEADER),
        timestamp: header(headers, TIMESTAMP_HEADER),
        signature: header(headers, SIGNATURE_HEADER),
        nonce: header(headers, NONCE_HEADER),
    };

    let key = match state.guard.authenticate(&signed, Utc::now().timestamp()).await {
        Ok(key) => key,
        Err(e) => {
            let reason = failure_reason(&e);
            metrics().auth_failures.with_label_values(&[reason]).inc();
            warn!(
                path = signed.path,
                access_key = signed.access_key.unwrap_or(""),
                reason,
                error = %e,
                "request rejected"
            );
            return ApiError(e).into_response();
        }
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let ip = caller_ip(headers, peer, &state.guard.trusted_proxies);
    let client_id = header(headers, CLIENT_ID_HEADER)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&key.access_key)
        .to_string();

    request.extensions_mut().insert(Caller { key, client_id, ip });
    next.run(request).await
}

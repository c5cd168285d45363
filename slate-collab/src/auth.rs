//! Access policy gate for inbound connections.
//!
//! Runs once per connection, before any event handler:
//! ```text
//! HTTP upgrade request
//!       │
//!       ▼
//! Handshake::from_request()     Authorization: Bearer … (preferred)
//!       │                       Cookie: token=…         (fallback)
//!       │                       ?roomId=…               (query)
//!       ▼
//! verify_token()                HS256 signature + expiry
//!       │
//!       ▼
//! authenticate()                room lookup + access rule:
//!       │                       isPublic OR caller ∈ participants
//!       ▼
//! Principal (attached to the connection for its lifetime)
//! ```
//!
//! The gate is read-only against the store. Rejection reasons are kept
//! distinct for diagnostics but the client only ever sees a generic
//! authentication error.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::SystemTime;
use tokio_tungstenite::tungstenite::http;

use crate::store::RoomStore;

type HmacSha256 = Hmac<Sha256>;

/// An authenticated identity derived from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    /// Token issue time (seconds since the Unix epoch).
    pub issued_at: u64,
}

/// Why the gate rejected a connection. Logged server-side; never sent
/// to the client in distinct form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token presented, or no signing secret configured.
    NoCredential,
    /// Token malformed, signature mismatch, or expired.
    InvalidCredential,
    /// The presented room identifier has no durable record.
    RoomNotFound,
    /// Room exists but the caller lacks access.
    AccessDenied,
    /// Store lookup failed.
    Store(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCredential => write!(f, "no credential presented"),
            Self::InvalidCredential => write!(f, "invalid credential"),
            Self::RoomNotFound => write!(f, "room not found"),
            Self::AccessDenied => write!(f, "access denied to locked room"),
            Self::Store(e) => write!(f, "store lookup failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Credential material extracted from a connection's upgrade request.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub token: Option<String>,
    pub room_id: Option<String>,
}

impl Handshake {
    /// Extract the bearer token and room identifier from an HTTP
    /// upgrade request. The explicit `Authorization` header wins over
    /// the cookie-embedded fallback.
    pub fn from_request<T>(req: &http::Request<T>) -> Self {
        let bearer = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());

        let cookie_token = req
            .headers()
            .get(http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|cookies| {
                cookies.split(';').find_map(|pair| {
                    pair.trim()
                        .strip_prefix("token=")
                        .map(|t| t.to_string())
                })
            });

        let room_id = req.uri().query().and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("roomId=")
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string())
            })
        });

        Self {
            token: bearer.or(cookie_token),
            room_id,
        }
    }
}

/// HS256 token claims (the external login flow mints these).
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: String,
    email: String,
    iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Verify an HS256 JWT and extract the principal.
///
/// Checks the token structure, the HMAC-SHA256 signature over
/// `header.payload`, and the `exp` claim when present.
pub fn verify_token(token: &str, secret: &str) -> Result<Principal, AuthError> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
        _ => return Err(AuthError::InvalidCredential),
    };

    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::InvalidCredential)?;
    let header: Header =
        serde_json::from_slice(&header_json).map_err(|_| AuthError::InvalidCredential)?;
    if header.alg != "HS256" {
        return Err(AuthError::InvalidCredential);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| AuthError::InvalidCredential)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::InvalidCredential)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::InvalidCredential)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidCredential)?;
    let claims: Claims =
        serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidCredential)?;

    if let Some(exp) = claims.exp {
        if exp <= now_secs() {
            return Err(AuthError::InvalidCredential);
        }
    }

    Ok(Principal {
        user_id: claims.user_id,
        email: claims.email,
        issued_at: claims.iat,
    })
}

/// Issue an HS256 token for the given identity.
///
/// Token issuance belongs to the external login flow; this exists for
/// tooling and tests.
pub fn sign_token(
    user_id: &str,
    email: &str,
    secret: &str,
    expires_in_secs: Option<u64>,
) -> String {
    let now = now_secs();
    let header = Header {
        alg: "HS256".into(),
        typ: Some("JWT".into()),
    };
    let claims = Claims {
        user_id: user_id.into(),
        email: email.into(),
        iat: now,
        exp: expires_in_secs.map(|d| now + d),
    };

    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{header_b64}.{payload_b64}.{sig_b64}")
}

/// Authenticate a connection against room-access policy.
///
/// Pure gate: verifies the credential, then, when the handshake
/// targets a room, resolves it through the store (read-only) and
/// applies the access rule — allow when the room is public or the
/// caller is already a participant. A handshake with no target room
/// is admitted on the credential alone (the connection has to exist
/// before it can create its first room).
pub fn authenticate(
    handshake: &Handshake,
    secret: Option<&str>,
    store: &RoomStore,
) -> Result<Principal, AuthError> {
    let secret = secret.ok_or(AuthError::NoCredential)?;
    let token = handshake.token.as_deref().ok_or(AuthError::NoCredential)?;

    let principal = verify_token(token, secret)?;

    let Some(room_id) = handshake.room_id.as_deref() else {
        return Ok(principal);
    };
    let room = store
        .find_room(room_id)
        .map_err(|e| AuthError::Store(e.to_string()))?
        .ok_or(AuthError::RoomNotFound)?;

    if !room.is_public && !room.has_participant(&principal.user_id) {
        return Err(AuthError::AccessDenied);
    }

    Ok(principal)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoomData;
    use crate::store::{Room, StoreConfig};

    const SECRET: &str = "test-secret";

    fn open_store(dir: &tempfile::TempDir) -> RoomStore {
        RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn request(headers: &[(&str, &str)], uri: &str) -> http::Request<()> {
        let mut builder = http::Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_roundtrip() {
        let token = sign_token("u1", "u1@example.com", SECRET, Some(3600));
        let principal = verify_token(&token, SECRET).unwrap();
        assert_eq!(principal.user_id, "u1");
        assert_eq!(principal.email, "u1@example.com");
        assert!(principal.issued_at > 0);
    }

    #[test]
    fn test_token_wrong_secret() {
        let token = sign_token("u1", "u1@example.com", SECRET, None);
        assert_eq!(
            verify_token(&token, "other-secret"),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_token_expired() {
        let token = sign_token("u1", "u1@example.com", SECRET, Some(0));
        assert_eq!(verify_token(&token, SECRET), Err(AuthError::InvalidCredential));
    }

    #[test]
    fn test_token_no_expiry_accepted() {
        let token = sign_token("u1", "u1@example.com", SECRET, None);
        assert!(verify_token(&token, SECRET).is_ok());
    }

    #[test]
    fn test_token_malformed() {
        assert_eq!(verify_token("garbage", SECRET), Err(AuthError::InvalidCredential));
        assert_eq!(verify_token("a.b", SECRET), Err(AuthError::InvalidCredential));
        assert_eq!(
            verify_token("a.b.c.d", SECRET),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_token_tampered_payload() {
        let token = sign_token("u1", "u1@example.com", SECRET, None);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD
            .encode(r#"{"userId":"admin","email":"x","iat":1}"#);
        parts[1] = &forged;
        assert_eq!(
            verify_token(&parts.join("."), SECRET),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_handshake_prefers_bearer_over_cookie() {
        let req = request(
            &[
                ("Authorization", "Bearer header-token"),
                ("Cookie", "theme=dark; token=cookie-token"),
            ],
            "ws://localhost/?roomId=r1",
        );
        let hs = Handshake::from_request(&req);
        assert_eq!(hs.token.as_deref(), Some("header-token"));
        assert_eq!(hs.room_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_handshake_cookie_fallback() {
        let req = request(
            &[("Cookie", "token=cookie-token; theme=dark")],
            "ws://localhost/?roomId=r1",
        );
        let hs = Handshake::from_request(&req);
        assert_eq!(hs.token.as_deref(), Some("cookie-token"));
    }

    #[test]
    fn test_handshake_missing_everything() {
        let req = request(&[], "ws://localhost/");
        let hs = Handshake::from_request(&req);
        assert!(hs.token.is_none());
        assert!(hs.room_id.is_none());
    }

    #[test]
    fn test_authenticate_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let hs = Handshake {
            token: None,
            room_id: Some("r".into()),
        };
        assert_eq!(
            authenticate(&hs, Some(SECRET), &store),
            Err(AuthError::NoCredential)
        );

        // A configured token is useless without a server secret.
        let hs = Handshake {
            token: Some(sign_token("u1", "e", SECRET, None)),
            room_id: Some("r".into()),
        };
        assert_eq!(authenticate(&hs, None, &store), Err(AuthError::NoCredential));
    }

    #[test]
    fn test_authenticate_without_room_admits_on_token_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let hs = Handshake {
            token: Some(sign_token("u1", "u1@example.com", SECRET, None)),
            room_id: None,
        };
        let principal = authenticate(&hs, Some(SECRET), &store).unwrap();
        assert_eq!(principal.user_id, "u1");
    }

    #[test]
    fn test_authenticate_room_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let hs = Handshake {
            token: Some(sign_token("u1", "e", SECRET, None)),
            room_id: Some("missing".into()),
        };
        assert_eq!(
            authenticate(&hs, Some(SECRET), &store),
            Err(AuthError::RoomNotFound)
        );
    }

    #[test]
    fn test_access_rule_private_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let room = Room::create("Private", "alice", false, RoomData::default());
        store.insert_room(&room).unwrap();

        // Non-participant rejected for a locked room.
        let outsider = Handshake {
            token: Some(sign_token("bob", "bob@example.com", SECRET, None)),
            room_id: Some(room.room_id.clone()),
        };
        assert_eq!(
            authenticate(&outsider, Some(SECRET), &store),
            Err(AuthError::AccessDenied)
        );

        // Participant admitted.
        let member = Handshake {
            token: Some(sign_token("alice", "alice@example.com", SECRET, None)),
            room_id: Some(room.room_id),
        };
        let principal = authenticate(&member, Some(SECRET), &store).unwrap();
        assert_eq!(principal.user_id, "alice");
    }

    #[test]
    fn test_access_rule_public_room_admits_anyone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let room = Room::create("Open", "alice", true, RoomData::default());
        store.insert_room(&room).unwrap();

        let outsider = Handshake {
            token: Some(sign_token("stranger", "s@example.com", SECRET, None)),
            room_id: Some(room.room_id),
        };
        assert!(authenticate(&outsider, Some(SECRET), &store).is_ok());
    }
}

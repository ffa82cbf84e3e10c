//! Basic credential check applied to every `/api` and `/graphql` request.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AuthConfig;

/// Configured credentials. Only a digest of the password is kept.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password_digest: [u8; 32],
}

impl Credentials {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password_digest: digest(&config.password),
        }
    }

    fn verify(&self, user: &str, pass: &str) -> bool {
        // compare digests so timing does not depend on the password prefix
        let user_ok = digest(user) == digest(&self.username);
        let pass_ok = digest(pass) == self.password_digest;
        user_ok & pass_ok
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}

pub async fn basic_auth_middleware(
    State(creds): State<Arc<Credentials>>,
    req: Request,
    next: Next,
) -> Response {
    match check_basic_auth(&creds, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(msg) => {
            debug!(path = %req.uri().path(), reason = msg, "rejected request");
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, r#"Basic realm="warden""#)],
                axum::Json(serde_json::json!({ "error": msg })),
            )
                .into_response()
        }
    }
}

fn check_basic_auth(creds: &Credentials, headers: &HeaderMap) -> Result<(), &'static str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or("missing Authorization header")?;
    let value = value.to_str().map_err(|_| "invalid Authorization header")?.trim();
    let b64 = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
        .ok_or("expected Basic authorization")?;
    let decoded = BASE64
        .decode(b64.trim().as_bytes())
        .map_err(|_| "invalid base64 in Authorization")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "invalid utf8 in Authorization")?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or("invalid basic auth payload")?;
    if creds.verify(user, pass) {
        Ok(())
    } else {
        Err("invalid credentials")
    }
}

/// `Authorization` header value for `user:pass`.
pub fn basic_header(user: &str, pass: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn creds() -> Credentials {
        Credentials::new(&AuthConfig {
            username: "admin".into(),
            password: "s3cret".into(),
        })
    }

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn test_accepts_configured_credentials() {
        assert!(check_basic_auth(&creds(), &headers(&basic_header("admin", "s3cret"))).is_ok());
    }

    #[test]
    fn test_rejects_bad_credentials() {
        let c = creds();
        assert_eq!(
            check_basic_auth(&c, &HeaderMap::new()),
            Err("missing Authorization header")
        );
        assert_eq!(
            check_basic_auth(&c, &headers(&basic_header("admin", "wrong"))),
            Err("invalid credentials")
        );
        assert_eq!(
            check_basic_auth(&c, &headers(&basic_header("root", "s3cret"))),
            Err("invalid credentials")
        );
        assert_eq!(
            check_basic_auth(&c, &headers("Bearer abc")),
            Err("expected Basic authorization")
        );
        assert_eq!(
            check_basic_auth(&c, &headers("Basic !!!")),
            Err("invalid base64 in Authorization")
        );
    }
}

//! HTTP basic authentication for the metrics endpoint.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

/// Realm announced in `WWW-Authenticate` challenges.
pub const REALM: &str = "surveyor";

/// The one user allowed to scrape.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    user: String,
    password: String,
}

impl BasicAuth {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Whether `headers` carry this user's credentials.
    pub fn verify(&self, headers: &HeaderMap) -> bool {
        let Some((user, password)) = credentials(headers) else {
            debug!("request without basic credentials");
            return false;
        };
        let ok = constant_time_eq(user.as_bytes(), self.user.as_bytes())
            & constant_time_eq(password.as_bytes(), self.password.as_bytes());
        if !ok {
            warn!(%user, "rejected basic credentials");
        }
        ok
    }
}

/// Decode `Authorization: Basic <base64(user:password)>`.
fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware: pass through with valid credentials, else 401 with a
/// `WWW-Authenticate` challenge.
pub async fn require_basic_auth(
    State(auth): State<Arc<BasicAuth>>,
    request: Request,
    next: Next,
) -> Response {
    if auth.verify(request.headers()) {
        return next.run(request).await;
    }

    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    let challenge = format!("Basic realm=\"{REALM}\"");
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[test]
    fn accepts_matching_credentials() {
        let auth = BasicAuth::new("colin", "secret");
        assert!(auth.verify(&headers(&basic("colin", "secret"))));
    }

    #[test]
    fn rejects_wrong_user_or_password() {
        let auth = BasicAuth::new("colin", "secret");
        assert!(!auth.verify(&headers(&basic("foo", "secret"))));
        assert!(!auth.verify(&headers(&basic("colin", "wrong"))));
        assert!(!auth.verify(&headers(&basic("colin", "secret2"))));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        let auth = BasicAuth::new("colin", "secret");
        assert!(!auth.verify(&HeaderMap::new()));
        assert!(!auth.verify(&headers("Bearer abc")));
        assert!(!auth.verify(&headers("Basic !!!notbase64")));
        assert!(!auth.verify(&headers(&format!("Basic {}", STANDARD.encode("nocolon")))));
    }

    #[test]
    fn password_may_contain_colons() {
        let auth = BasicAuth::new("colin", "a:b:c");
        assert!(auth.verify(&headers(&basic("colin", "a:b:c"))));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let auth = BasicAuth::new("colin", "secret");
        let value = basic("colin", "secret").replacen("Basic", "basic", 1);
        assert!(auth.verify(&headers(&value)));
    }
}

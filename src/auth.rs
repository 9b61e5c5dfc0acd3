//! HTTP Basic authentication for terminal routes
//!
//! Credentials can be set globally on the server or per route; a route's
//! credentials replace the global ones. Rejections happen in the proxy before
//! any backend is contacted.

use crate::error::{ErrorResponse, GatewayError, ProxyErrorCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::Response;
use serde::Deserialize;

/// Realm advertised in authentication challenges
pub const REALM: &str = "ttygate";

/// Username and password for a route
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization` header carrying these credentials
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Check an `Authorization` header against these credentials
    pub fn verify(&self, header: Option<&HeaderValue>) -> bool {
        let Some((username, password)) = header.and_then(parse_basic) else {
            return false;
        };

        // Evaluate both comparisons so timing does not reveal which one failed
        let user_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        user_ok & pass_ok
    }
}

/// Decode a `Basic` authorization header into username and password
fn parse_basic(header: &HeaderValue) -> Option<(String, String)> {
    let value = header.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 401 response carrying a Basic challenge
pub fn challenge_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let err = GatewayError::Authentication;
    let code = ProxyErrorCode::from(&err);
    let body = ErrorResponse::new(code, err.to_string()).to_json();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .header(WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", REALM))
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    let Some(auth) = headers.get(header::AUTHORIZATION) else {
        return None;
    };
    auth.to_str().ok()
}

/// `Authorization: Bearer <token>` check.
///
/// Exactly two whitespace-separated parts, scheme compared case-insensitively,
/// token compared in constant time once the lengths match.
pub fn authorized_bearer_token(auth_header: Option<&str>, expected: &str) -> bool {
    let Some(auth_header) = auth_header else {
        return false;
    };
    let parts: Vec<&str> = auth_header.split_whitespace().collect();
    let [scheme, presented] = parts.as_slice() else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return false;
    }
    if presented.len() != expected.len() {
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    authorized_bearer_token(authorization_header(headers), expected)
}

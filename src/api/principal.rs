use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use base64::Engine;

/// The user a request claims to act for: the username of an
/// `Authorization: Basic` header, or empty. Nothing is verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal(pub String);

/// Extract the username from a Basic `Authorization` header.
fn basic_username(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let user = match credentials.split_once(':') {
        Some((user, _password)) => user,
        None => credentials.as_str(),
    };
    Some(user.to_string())
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Principal(basic_username(&parts.headers).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn basic_header_yields_username() {
        // "dispatcher:hunter2"
        let h = headers("Basic ZGlzcGF0Y2hlcjpodW50ZXIy");
        assert_eq!(basic_username(&h).as_deref(), Some("dispatcher"));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let h = headers("basic ZGlzcGF0Y2hlcjpodW50ZXIy");
        assert_eq!(basic_username(&h).as_deref(), Some("dispatcher"));
    }

    #[test]
    fn bearer_and_garbage_are_ignored() {
        assert_eq!(basic_username(&headers("Bearer abc")), None);
        assert_eq!(basic_username(&headers("Basic !!!not-base64")), None);
        assert_eq!(basic_username(&HeaderMap::new()), None);
    }

    #[test]
    fn missing_password_separator_uses_whole_value() {
        // "solo"
        let h = headers("Basic c29sbw==");
        assert_eq!(basic_username(&h).as_deref(), Some("solo"));
    }
}

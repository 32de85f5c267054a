//! Handshake authentication.
//!
//! Identity rides on the upgrade request: `profile_id`, `user_info_id` and
//! `user_public_id` as cookies, with query parameters as a fallback for
//! clients that cannot set cookies on WebSocket upgrades. Session
//! validation happens upstream at the edge; this module only extracts and
//! sanity-checks the asserted identity. A missing or malformed identity
//! refuses the connection before the upgrade completes.

use axum::http::HeaderMap;
use std::collections::HashMap;

use crate::errors::GatewayError;

/// The authenticated identity bound to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Internal profile id; the key for presence and room membership,
    /// and the `user_id` other clients see in events.
    pub profile_id: String,
    /// Internal user-info record id. Carried for connection logs; room
    /// state never keys on it.
    pub user_info_id: String,
    /// Public-facing id. Carried for connection logs; events identify
    /// users by profile id.
    pub public_id: String,
}

/// Extract the identity from an upgrade request.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthenticated`] if any identity field is
/// missing or malformed.
pub fn authenticate(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Identity, GatewayError> {
    let cookies = parse_cookies(headers);

    let profile_id = field(&cookies, query, "profile_id")?;
    let user_info_id = field(&cookies, query, "user_info_id")?;
    let public_id = field(&cookies, query, "user_public_id")?;

    Ok(Identity {
        profile_id,
        user_info_id,
        public_id,
    })
}

fn field(
    cookies: &HashMap<String, String>,
    query: &HashMap<String, String>,
    name: &str,
) -> Result<String, GatewayError> {
    let value = cookies
        .get(name)
        .or_else(|| query.get(name))
        .ok_or_else(|| GatewayError::Unauthenticated(format!("missing {name}")))?;

    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::Unauthenticated(format!("empty {name}")));
    }
    if value.len() > 128 || value.chars().any(char::is_control) {
        return Err(GatewayError::Unauthenticated(format!("malformed {name}")));
    }

    Ok(value.to_string())
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(text) = value.to_str() else {
            continue;
        };
        for pair in text.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie.parse().unwrap());
        headers
    }

    #[test]
    fn test_identity_from_cookies() {
        let headers =
            headers_with_cookie("profile_id=p1; user_info_id=ui1; user_public_id=pub1");
        let identity = authenticate(&headers, &HashMap::new()).unwrap();
        assert_eq!(identity.profile_id, "p1");
        assert_eq!(identity.user_info_id, "ui1");
        assert_eq!(identity.public_id, "pub1");
    }

    #[test]
    fn test_query_fallback() {
        let query = HashMap::from([
            ("profile_id".to_string(), "p2".to_string()),
            ("user_info_id".to_string(), "ui2".to_string()),
            ("user_public_id".to_string(), "pub2".to_string()),
        ]);
        let identity = authenticate(&HeaderMap::new(), &query).unwrap();
        assert_eq!(identity.profile_id, "p2");
    }

    #[test]
    fn test_cookie_takes_precedence_over_query() {
        let headers =
            headers_with_cookie("profile_id=cookie; user_info_id=ui; user_public_id=pub");
        let query = HashMap::from([("profile_id".to_string(), "query".to_string())]);
        let identity = authenticate(&headers, &query).unwrap();
        assert_eq!(identity.profile_id, "cookie");
    }

    #[test]
    fn test_missing_identity_rejected() {
        let result = authenticate(&HeaderMap::new(), &HashMap::new());
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_empty_field_rejected() {
        let headers = headers_with_cookie("profile_id=; user_info_id=ui; user_public_id=pub");
        let result = authenticate(&headers, &HashMap::new());
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_oversized_field_rejected() {
        let big = "x".repeat(200);
        let headers = headers_with_cookie(&format!(
            "profile_id={big}; user_info_id=ui; user_public_id=pub"
        ));
        let result = authenticate(&headers, &HashMap::new());
        assert!(matches!(result, Err(GatewayError::Unauthenticated(_))));
    }
}

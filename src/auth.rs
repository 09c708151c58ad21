use std::collections::HashSet;

use axum::http::{header, HeaderMap};
use serde::Deserialize;

/// Decides whether a request comes from a signed-in caller.
///
/// Sessions are issued elsewhere; this only checks what the request carries.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> bool;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub allow_anonymous: bool,
}

/// Accepts a known token from `Authorization: Bearer` or the `session` cookie.
#[derive(Debug, Clone)]
pub struct TokenAuthorizer {
    tokens: HashSet<String>,
    allow_anonymous: bool,
}

impl TokenAuthorizer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: config.tokens.iter().cloned().collect(),
            allow_anonymous: config.allow_anonymous,
        }
    }

    fn bearer<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
    }

    fn session_cookies<'a>(headers: &'a HeaderMap) -> impl Iterator<Item = &'a str> + 'a {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().strip_prefix("session="))
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> bool {
        if self.allow_anonymous {
            return true;
        }
        if let Some(token) = Self::bearer(headers) {
            if self.tokens.contains(token) {
                return true;
            }
        }
        Self::session_cookies(headers).any(|token| self.tokens.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authorizer() -> TokenAuthorizer {
        TokenAuthorizer::new(&AuthConfig {
            tokens: vec!["t0k3n".to_string()],
            allow_anonymous: false,
        })
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(!authorizer().authorize(&headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t0k3n"));
        assert!(authorizer().authorize(&headers));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!authorizer().authorize(&headers));
    }

    #[test]
    fn test_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=t0k3n"));
        assert!(authorizer().authorize(&headers));

        headers.insert(header::COOKIE, HeaderValue::from_static("session=other"));
        assert!(!authorizer().authorize(&headers));
    }

    #[test]
    fn test_anonymous_allowed() {
        let auth = TokenAuthorizer::new(&AuthConfig {
            tokens: Vec::new(),
            allow_anonymous: true,
        });
        assert!(auth.authorize(&HeaderMap::new()));
    }
}

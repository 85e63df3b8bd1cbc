use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use url::form_urlencoded;

use shared_models::auth::BearerToken;

pub const DEFAULT_TOKEN_COOKIE: &str = "token";

/// Source of the current bearer credential. Consulted whenever a socket
/// handshake is about to be (re)attempted so expired tokens get refreshed.
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> Option<BearerToken>;
}

impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    fn current_token(&self) -> Option<BearerToken> {
        (**self).current_token()
    }
}

/// Always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<BearerToken>,
}

impl StaticTokenProvider {
    pub fn new(raw: &str) -> Self {
        Self {
            token: BearerToken::parse(raw).ok(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn current_token(&self) -> Option<BearerToken> {
        self.token.clone()
    }
}

/// Reads the token out of a `Cookie` header that the host application keeps
/// current (for instance after a login or silent refresh).
#[derive(Debug)]
pub struct CookieTokenProvider {
    cookie_name: String,
    cookie_header: RwLock<String>,
}

impl CookieTokenProvider {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            cookie_header: RwLock::new(String::new()),
        }
    }

    pub fn with_header(cookie_name: impl Into<String>, header: impl Into<String>) -> Self {
        let provider = Self::new(cookie_name);
        provider.update(header);
        provider
    }

    pub fn update(&self, header: impl Into<String>) {
        *self.cookie_header.write() = header.into();
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

impl Default for CookieTokenProvider {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_COOKIE)
    }
}

impl TokenProvider for CookieTokenProvider {
    fn current_token(&self) -> Option<BearerToken> {
        let header = self.cookie_header.read();
        let value = cookie_value(&header, &self.cookie_name)?;
        match BearerToken::parse(&value) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!("Ignoring unusable {} cookie: {}", self.cookie_name, e);
                None
            }
        }
    }
}

/// Extract and percent-decode a single cookie from a `Cookie` header.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .flat_map(|pair| form_urlencoded::parse(pair.as_bytes()).take(1))
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value_lookup() {
        let header = "theme=dark; token=Bearer%20abc.def; lang=en";
        assert_eq!(cookie_value(header, "token").as_deref(), Some("Bearer abc.def"));
        assert_eq!(cookie_value(header, "lang").as_deref(), Some("en"));
        assert_eq!(cookie_value(header, "missing"), None);
    }

    #[test]
    fn test_cookie_provider_tracks_updates() {
        let provider = CookieTokenProvider::default();
        assert!(provider.current_token().is_none());

        provider.update("token=first");
        assert_eq!(provider.current_token().unwrap().as_str(), "first");

        provider.update("token=Bearer%20second; other=1");
        assert_eq!(provider.current_token().unwrap().as_str(), "second");
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticTokenProvider::new("Bearer static-token");
        assert_eq!(provider.current_token().unwrap().as_str(), "static-token");

        let empty = StaticTokenProvider::new("   ");
        assert!(empty.current_token().is_none());
    }

    #[test]
    fn test_arc_provider_delegates() {
        let provider: Arc<dyn TokenProvider> =
            Arc::new(CookieTokenProvider::with_header("auth", "auth=xyz"));
        assert_eq!(provider.current_token().unwrap().as_str(), "xyz");
    }
}

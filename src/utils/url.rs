//! URL utilities for consistent URL handling

use url::Url;

/// URL helpers used by the detector, proxy and tuner surface.
pub struct UrlUtils;

impl UrlUtils {
    /// Parse and validate an absolute URL.
    pub fn parse_and_validate(url: &str) -> Result<Url, url::ParseError> {
        Url::parse(url)
    }

    /// Check if a URL is a well-formed absolute URL.
    pub fn is_valid(url: &str) -> bool {
        Url::parse(url).is_ok()
    }

    /// Join a base URL with a path segment, handling trailing slashes.
    pub fn join(base: &str, path: &str) -> Result<String, url::ParseError> {
        let base_url = Url::parse(base)?;
        let joined = base_url.join(path)?;
        Ok(joined.to_string())
    }

    /// Extract the host from a URL, if any.
    pub fn extract_host(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Strip query string and fragment, for extension heuristics.
    pub fn strip_query_and_fragment(url: &str) -> String {
        let without_fragment = url.split('#').next().unwrap_or(url);
        without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment)
            .to_string()
    }

    /// Embed HTTP Basic credentials into an http(s) URL.
    pub fn with_basic_auth(url: &str, username: &str, password: &str) -> Result<String, url::ParseError> {
        let mut parsed = Url::parse(url)?;
        if parsed.scheme() == "http" || parsed.scheme() == "https" {
            // set_username/set_password only fail for cannot-be-a-base URLs
            let _ = parsed.set_username(username);
            let _ = parsed.set_password(Some(password));
        }
        Ok(parsed.to_string())
    }
}

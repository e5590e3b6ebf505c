//! Cookie helpers for token transport.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderValue, header};

/// SameSite policy for cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
        }
    }
}

/// Attributes of one cookie written by the issuance endpoint.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: &'static str,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub path: &'static str,
    pub max_age_secs: Option<u64>,
}

impl CookieConfig {
    pub fn build_set_cookie(&self, value: &str) -> String {
        let mut cookie = format!("{}={}", self.name, value);

        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; SameSite=");
        cookie.push_str(self.same_site.as_str());
        cookie.push_str("; Path=");
        cookie.push_str(self.path);

        if let Some(max_age) = self.max_age_secs {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }

        cookie
    }

    /// Set-Cookie value that expires the cookie immediately.
    pub fn build_delete_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path={}; Max-Age=0", self.name, self.path);
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn header_value(&self, value: &str) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.build_set_cookie(value)).ok()
    }
}

/// All cookies sent with a request. The first occurrence of a name wins.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies
                    .entry(name.trim().to_string())
                    .or_insert_with(|| value.trim().to_string());
            }
        }
    }
    cookies
}

/// Extract a single cookie value from headers
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    parse_cookies(headers).remove(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_config_build() {
        let config = CookieConfig {
            name: "csrf-session",
            secure: true,
            http_only: true,
            same_site: SameSite::Strict,
            path: "/",
            max_age_secs: Some(3600),
        };

        let cookie = config.build_set_cookie("abc");
        assert_eq!(
            cookie,
            "csrf-session=abc; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=3600"
        );
        assert_eq!(
            config.build_delete_cookie(),
            "csrf-session=; Path=/; Max-Age=0; HttpOnly; Secure"
        );
    }

    #[test]
    fn test_readable_cookie_omits_http_only() {
        let config = CookieConfig {
            name: "csrf-token",
            secure: false,
            http_only: false,
            same_site: SameSite::Strict,
            path: "/",
            max_age_secs: None,
        };
        assert_eq!(config.build_set_cookie("t"), "csrf-token=t; SameSite=Strict; Path=/");
    }

    #[test]
    fn test_extract_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("foo=bar; session=abc123; foo=shadow; other=x=y"),
        );

        assert_eq!(extract_cookie(&headers, "session"), Some("abc123".to_string()));
        assert_eq!(extract_cookie(&headers, "foo"), Some("bar".to_string()));
        assert_eq!(extract_cookie(&headers, "other"), Some("x=y".to_string()));
        assert_eq!(extract_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_multiple_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("b=2"));
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("b").map(String::as_str), Some("2"));
    }
}

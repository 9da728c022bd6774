//! Derives a connection's domain from its handshake headers.

use axum::http::{header, HeaderMap};
use url::Url;

/// Domain used when no usable header is present.
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// Pick the first non-empty of `Origin`, `Referer`, `Host` and reduce it to a
/// hostname. Never fails and never returns an empty string.
pub fn resolve_domain(headers: &HeaderMap) -> String {
    let raw = [header::ORIGIN, header::REFERER, header::HOST]
        .iter()
        .find_map(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
        });

    match raw {
        Some(raw) => domain_from_value(raw),
        None => UNKNOWN_DOMAIN.to_string(),
    }
}

/// Hostname of `raw` read as a URL (`https://` assumed when no scheme is
/// given). Unparseable input falls back to everything before the first `/`.
pub fn domain_from_value(raw: &str) -> String {
    let parsed = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    };

    let host = match parsed {
        Ok(url) => url.host_str().unwrap_or_default().to_string(),
        Err(_) => raw.split('/').next().unwrap_or_default().to_string(),
    };

    if host.is_empty() {
        UNKNOWN_DOMAIN.to_string()
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn origin_url_resolves_to_hostname() {
        let h = headers(&[("origin", "https://foo.bar/path")]);
        assert_eq!(resolve_domain(&h), "foo.bar");
    }

    #[test]
    fn bare_host_drops_port() {
        let h = headers(&[("host", "foo.bar:8080")]);
        assert_eq!(resolve_domain(&h), "foo.bar");
    }

    #[test]
    fn no_headers_is_unknown() {
        assert_eq!(resolve_domain(&HeaderMap::new()), UNKNOWN_DOMAIN);
    }

    #[test]
    fn origin_wins_over_referer_and_host() {
        let h = headers(&[
            ("host", "internal:3002"),
            ("referer", "https://ref.example/page"),
            ("origin", "https://site.example"),
        ]);
        assert_eq!(resolve_domain(&h), "site.example");
    }

    #[test]
    fn referer_used_when_origin_missing() {
        let h = headers(&[
            ("host", "internal:3002"),
            ("referer", "http://ref.example:8000/a/b?c=d"),
        ]);
        assert_eq!(resolve_domain(&h), "ref.example");
    }

    #[test]
    fn empty_origin_counts_as_missing() {
        let h = headers(&[("origin", ""), ("host", "fallback.example")]);
        assert_eq!(resolve_domain(&h), "fallback.example");
    }

    #[test]
    fn unparseable_value_falls_back_to_prefix() {
        assert_eq!(domain_from_value("bad host/x/y"), "bad host");
    }

    #[test]
    fn hostless_url_is_unknown() {
        assert_eq!(domain_from_value("file:///etc/hosts"), UNKNOWN_DOMAIN);
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        assert_eq!(domain_from_value("[::1]:3000"), "[::1]");
    }

    #[test]
    fn non_special_scheme_host() {
        assert_eq!(domain_from_value("chrome-extension://abcdef/popup.html"), "abcdef");
    }
}

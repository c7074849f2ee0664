//! Client metadata derived from request headers

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "unknown";

/// Client details attached to credit transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub ip_address: String,
    pub user_agent: String,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            ip_address: UNKNOWN.to_string(),
            user_agent: UNKNOWN.to_string(),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Client IP: first `x-forwarded-for` hop, then `x-real-ip`, then `cf-connecting-ip`
pub fn client_ip(headers: &HeaderMap) -> String {
    header(headers, "x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header(headers, "x-real-ip"))
        .or_else(|| header(headers, "cf-connecting-ip"))
        .unwrap_or(UNKNOWN)
        .to_string()
}

pub fn extract_request_metadata(headers: &HeaderMap) -> RequestMetadata {
    RequestMetadata {
        ip_address: client_ip(headers),
        user_agent: header(headers, "user-agent").unwrap_or(UNKNOWN).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_segment() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&map), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_fallback() {
        let map = headers(&[("x-real-ip", "198.51.100.2"), ("cf-connecting-ip", "192.0.2.9")]);
        assert_eq!(client_ip(&map), "198.51.100.2");
    }

    #[test]
    fn test_cf_connecting_ip_only() {
        let map = headers(&[("cf-connecting-ip", "192.0.2.9")]);
        assert_eq!(client_ip(&map), "192.0.2.9");
    }

    #[test]
    fn test_no_headers_is_unknown() {
        let metadata = extract_request_metadata(&HeaderMap::new());
        assert_eq!(metadata.ip_address, "unknown");
        assert_eq!(metadata.user_agent, "unknown");
        assert_eq!(metadata, RequestMetadata::default());
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let map = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&map), "198.51.100.2");
    }

    #[test]
    fn test_user_agent() {
        let map = headers(&[("user-agent", "curl/8.5.0")]);
        assert_eq!(extract_request_metadata(&map).user_agent, "curl/8.5.0");
    }
}

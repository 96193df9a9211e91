//! Decides, per message, whether the zstd transform applies.

use crate::config::ZstdConfig;
use http::{HeaderMap, Method, header};

/// The message a decision is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject<'a> {
    /// An inbound request that may carry an encoded body.
    Request {
        /// Request method.
        method: &'a Method,
        /// Value of the request's `Content-Encoding` header.
        content_encoding: Option<&'a str>,
    },
    /// An outbound response that may be compressed.
    Response {
        /// Value of the response's `Content-Type` header.
        content_type: Option<&'a str>,
        /// Response body length in bytes.
        body_len: usize,
        /// Value of the response's `Content-Encoding` header.
        content_encoding: Option<&'a str>,
    },
}

/// Compression eligibility rules.
///
/// A policy is immutable once built and is shared by every exchange.
#[derive(Debug, Clone)]
pub struct Policy {
    encoding: &'static str,
    min_size: usize,
    content_types: Vec<String>,
    decode_methods: Vec<Method>,
}

impl Policy {
    /// Builds a policy for the `encoding` content coding from `config`.
    pub fn new(encoding: &'static str, config: &ZstdConfig) -> Self {
        Self {
            encoding,
            min_size: config.min_size,
            content_types: config
                .content_types
                .iter()
                .map(|ct| ct.trim().to_ascii_lowercase())
                .collect(),
            decode_methods: config.decode_methods.clone(),
        }
    }

    /// Returns the content coding this policy decides for.
    pub fn encoding(&self) -> &'static str {
        self.encoding
    }

    /// Returns whether the transform applies to `subject`.
    ///
    /// Responses qualify when their media type is in the allow-set and the body
    /// is strictly larger than the minimum size. Requests qualify when they are
    /// marked with this encoding and use a decode method.
    pub fn should_transform(&self, subject: &Subject<'_>) -> bool {
        match *subject {
            Subject::Request {
                method,
                content_encoding,
            } => {
                content_encoding.is_some_and(|v| self.is_marker(v))
                    && self.decode_methods.contains(method)
            }
            Subject::Response {
                content_type,
                body_len,
                content_encoding,
            } => {
                content_encoding.is_none()
                    && self.is_allowed_content_type(content_type)
                    && body_len > self.min_size
            }
        }
    }

    /// Returns whether a request with these parts carries a body to decode.
    pub fn should_decode_request(&self, method: &Method, headers: &HeaderMap) -> bool {
        self.should_transform(&Subject::Request {
            method,
            content_encoding: header_str(headers, header::CONTENT_ENCODING),
        })
    }

    /// Returns whether a response with these headers and a `body_len` byte body
    /// should be compressed. Range responses are never compressed.
    pub fn should_encode_response(&self, headers: &HeaderMap, body_len: usize) -> bool {
        !headers.contains_key(header::CONTENT_RANGE)
            && self.should_transform(&Subject::Response {
                content_type: header_str(headers, header::CONTENT_TYPE),
                body_len,
                content_encoding: header_str(headers, header::CONTENT_ENCODING),
            })
    }

    /// Returns whether a response of unknown length would qualify once its body
    /// exceeds the minimum size.
    pub fn may_encode_response(&self, headers: &HeaderMap) -> bool {
        self.should_encode_response(headers, usize::MAX)
    }

    fn is_marker(&self, value: &str) -> bool {
        value.trim().eq_ignore_ascii_case(self.encoding)
    }

    fn is_allowed_content_type(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let essence = media_type_essence(content_type);
        self.content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }
}

/// Returns the `type/subtype` part of a media type, without parameters.
pub(crate) fn media_type_essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

/// Returns whether an `Accept-Encoding` value admits `encoding` with a
/// non-zero quality. An explicit entry for `encoding` wins over `*`.
pub(crate) fn accepts_encoding(header: &str, encoding: &str) -> bool {
    let mut wildcard = None;
    for (coding, quality) in header.split(',').map(coding_and_quality) {
        if coding.eq_ignore_ascii_case(encoding) {
            return quality > 0.0;
        }
        if coding == "*" {
            wildcard = Some(quality > 0.0);
        }
    }
    wildcard.unwrap_or(false)
}

/// Splits one `Accept-Encoding` list member into its coding and `q` weight.
/// A missing or unparsable weight counts as 1.
fn coding_and_quality(member: &str) -> (&str, f32) {
    let (coding, params) = member.split_once(';').unwrap_or((member, ""));
    let quality = params
        .split(';')
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
        .and_then(|(_, value)| value.trim().parse::<f32>().ok())
        .unwrap_or(1.0);
    (coding.trim(), quality)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn policy() -> Policy {
        Policy::new("zstd", &ZstdConfig::default())
    }

    fn response(content_type: &'static str, body_len: usize) -> Subject<'static> {
        Subject::Response {
            content_type: Some(content_type),
            body_len,
            content_encoding: None,
        }
    }

    fn request<'a>(method: &'a Method, content_encoding: Option<&'a str>) -> Subject<'a> {
        Subject::Request {
            method,
            content_encoding,
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let policy = policy();
        assert!(!policy.should_transform(&response("application/json", 1024)));
        assert!(policy.should_transform(&response("application/json", 1025)));
    }

    #[test]
    fn test_default_content_types() {
        let policy = policy();
        assert!(policy.should_transform(&response("text/plain", 2000)));
        assert!(policy.should_transform(&response("text/html; charset=utf-8", 2000)));
        assert!(policy.should_transform(&response("Application/JSON", 2000)));
        assert!(!policy.should_transform(&response("image/png", 2000)));
        assert!(!policy.should_transform(&response("application/octet-stream", 2000)));
    }

    #[test]
    fn test_missing_content_type() {
        let subject = Subject::Response {
            content_type: None,
            body_len: 4096,
            content_encoding: None,
        };
        assert!(!policy().should_transform(&subject));
    }

    #[test]
    fn test_already_encoded_response() {
        let subject = Subject::Response {
            content_type: Some("text/plain"),
            body_len: 4096,
            content_encoding: Some("gzip"),
        };
        assert!(!policy().should_transform(&subject));
    }

    #[test]
    fn test_configured_threshold_and_types() {
        let config = ZstdConfig::default()
            .with_min_size(10)
            .with_content_types(["application/xml"]);
        let policy = Policy::new("zstd", &config);
        assert!(policy.should_transform(&response("application/xml", 11)));
        assert!(!policy.should_transform(&response("application/json", 11)));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let policy = policy();
        let post = Method::POST;
        let subjects = [
            response("application/json", 1025),
            response("image/png", 5000),
            request(&post, Some("zstd")),
        ];
        for subject in &subjects {
            assert_eq!(
                policy.should_transform(subject),
                policy.should_transform(subject)
            );
        }
    }

    #[test]
    fn test_request_requires_marker_and_method() {
        let policy = policy();
        assert!(policy.should_transform(&request(&Method::POST, Some("zstd"))));
        assert!(policy.should_transform(&request(&Method::PUT, Some(" ZSTD "))));
        assert!(policy.should_transform(&request(&Method::PATCH, Some("zstd"))));
        assert!(!policy.should_transform(&request(&Method::GET, Some("zstd"))));
        assert!(!policy.should_transform(&request(&Method::POST, Some("gzip"))));
        assert!(!policy.should_transform(&request(&Method::POST, None)));
    }

    #[test]
    fn test_range_response_not_encoded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(policy().should_encode_response(&headers, 5000));
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 0-4999/10000"),
        );
        assert!(!policy().should_encode_response(&headers, 5000));
    }

    #[test]
    fn test_unknown_length_eligibility() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert!(policy().may_encode_response(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        assert!(!policy().may_encode_response(&headers));
    }

    #[test]
    fn test_accepts_encoding() {
        assert!(accepts_encoding("zstd", "zstd"));
        assert!(accepts_encoding("gzip, br, zstd", "zstd"));
        assert!(accepts_encoding("gzip;q=1.0, zstd;q=0.5", "zstd"));
        assert!(accepts_encoding("*", "zstd"));
        assert!(!accepts_encoding("gzip, br", "zstd"));
        assert!(!accepts_encoding("zstd;q=0", "zstd"));
        assert!(!accepts_encoding("*, zstd;q=0", "zstd"));
        assert!(!accepts_encoding("*;q=0", "zstd"));
    }

    #[test]
    fn test_quality_weight_parsing() {
        assert_eq!(coding_and_quality(" zstd "), ("zstd", 1.0));
        assert_eq!(coding_and_quality("zstd; Q=0.25"), ("zstd", 0.25));
        assert_eq!(coding_and_quality("zstd;level=3;q=0"), ("zstd", 0.0));
        assert_eq!(coding_and_quality("zstd;q=abc"), ("zstd", 1.0));
    }

    #[test]
    fn test_media_type_essence() {
        assert_eq!(media_type_essence("text/html; charset=utf-8"), "text/html");
        assert_eq!(media_type_essence(" application/json "), "application/json");
        assert_eq!(media_type_essence(""), "");
    }
}

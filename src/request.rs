//! Request model: verbs, parameter lists, body content, and per-request
//! options.
//!
//! A [`Request`] is immutable once submitted. Query parameters and extra
//! headers are ordered `(name, value)` pairs: duplicates are allowed and the
//! order given by the caller is the order on the wire.

use std::fmt;
use std::fmt::Write as _;

/// HTTP request method supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Returns the method as a string slice.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Returns true when a response to this method has a body only if the
    /// response head announces one.
    #[must_use]
    pub(crate) fn response_body_needs_framing(self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `(name, value)` pairs for query parameters and extra headers.
pub type Params = Vec<(String, String)>;

/// Request body content: payload bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    /// Body bytes sent on the wire.
    pub body: Vec<u8>,
    /// Value of the `Content-Type` header.
    pub mime_type: String,
}

impl Content {
    /// Creates content from a body and its MIME type.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Per-request options: query parameters, extra headers, and the deadline.
///
/// `timeout_ms <= 0` means the request has no deadline.
#[derive(Debug, Clone)]
pub struct RequestOpts {
    /// Query parameters appended to the resource path.
    pub query_params: Params,
    /// Extra headers appended after the mandatory ones, in order.
    pub headers: Params,
    /// Deadline in milliseconds; a value of zero or below disables it.
    pub timeout_ms: i64,
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            query_params: Params::new(),
            headers: Params::new(),
            timeout_ms: -1,
        }
    }
}

impl RequestOpts {
    /// Creates options with no parameters, no extra headers, no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((name.into(), value.into()));
        self
    }

    /// Adds an extra request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the per-request deadline in milliseconds.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// An immutable request record, as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP verb.
    pub method: Method,
    /// Resource path (e.g. `/counter`). A leading `/` is expected.
    pub resource: String,
    /// Ordered query parameters; percent-encoded at serialization time.
    pub query_params: Params,
    /// Ordered extra headers, sent verbatim.
    pub headers: Params,
    /// Optional body content for POST/PUT.
    pub content: Option<Content>,
    /// Deadline in milliseconds; `<= 0` disables it.
    pub timeout_ms: i64,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        resource: impl Into<String>,
        content: Option<Content>,
        opts: RequestOpts,
    ) -> Self {
        Self {
            method,
            resource: resource.into(),
            query_params: opts.query_params,
            headers: opts.headers,
            content,
            timeout_ms: opts.timeout_ms,
        }
    }

    /// Request target as it appears on the request line: the resource path
    /// plus the encoded query string, if any.
    #[must_use]
    pub fn target(&self) -> String {
        let mut target = self.resource.clone();
        if !self.query_params.is_empty() {
            target.push('?');
            target.push_str(&encode_query(&self.query_params));
        }
        target
    }
}

/// Percent-encodes query parameters and joins them with `&`.
///
/// Unreserved characters (RFC 3986) pass through; everything else is
/// `%XX`-encoded, bytewise for multi-byte UTF-8.
#[must_use]
pub fn encode_query(params: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (name, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        encode_component(&mut out, name);
        out.push('=');
        encode_component(&mut out, value);
    }
    out
}

fn encode_component(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => {
                let _ = write!(out, "%{other:02X}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_without_params_is_the_resource() {
        let req = Request::new(Method::Get, "/coucou", None, RequestOpts::default());
        assert_eq!(req.target(), "/coucou");
    }

    #[test]
    fn target_with_params_appends_query_string() {
        let opts = RequestOpts::new().query_param("value", "hello");
        let req = Request::new(Method::Get, "/query-params", None, opts);
        assert_eq!(req.target(), "/query-params?value=hello");
    }

    #[test]
    fn query_order_and_duplicates_are_preserved() {
        let opts = RequestOpts::new()
            .query_param("b", "2")
            .query_param("a", "1")
            .query_param("b", "3");
        let req = Request::new(Method::Get, "/r", None, opts);
        assert_eq!(req.target(), "/r?b=2&a=1&b=3");
    }

    #[test]
    fn reserved_characters_are_percent_encoded() {
        let params = vec![("q".to_owned(), "a b&c=d".to_owned())];
        assert_eq!(encode_query(&params), "q=a%20b%26c%3Dd");
    }

    #[test]
    fn unicode_is_encoded_bytewise() {
        let params = vec![("q".to_owned(), "é".to_owned())];
        assert_eq!(encode_query(&params), "q=%C3%A9");
    }

    #[test]
    fn default_opts_have_no_deadline() {
        assert!(RequestOpts::default().timeout_ms <= 0);
    }
}

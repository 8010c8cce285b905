//! HTTP/1.1 framing: request serialization and incremental response
//! decoding.
//!
//! The [`ResponseDecoder`] is fed raw bytes as they arrive from the socket
//! and yields at most one [`HttpResponse`]. Body framing honors, in order:
//! `Transfer-Encoding: chunked`, `Content-Length`, otherwise the body is
//! delimited by EOF (which implies the connection will not be reused).

use bytes::BytesMut;
use std::fmt;
use std::io;

use crate::request::{encode_query, Method, Request};

/// Maximum allowed header block size (64 KiB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum allowed body size (16 MiB).
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of headers.
const MAX_HEADERS: usize = 128;

/// HTTP/1.1 protocol errors raised while decoding a response.
#[derive(Debug)]
pub(crate) enum ProtocolError {
    /// An I/O error from the transport.
    Io(io::Error),
    /// The status line is malformed.
    BadStatusLine,
    /// A header line is malformed.
    BadHeader,
    /// Unsupported HTTP version in the response.
    UnsupportedVersion,
    /// Content-Length header is not a valid integer.
    BadContentLength,
    /// Incomplete or malformed chunked encoding.
    BadChunkedEncoding,
    /// Header block exceeds the configured limit.
    HeadersTooLarge,
    /// Too many headers.
    TooManyHeaders,
    /// Body exceeds the configured limit.
    BodyTooLarge,
    /// Both Content-Length and Transfer-Encoding present (RFC 7230 3.3.3).
    AmbiguousBodyLength,
    /// The peer closed the connection mid-response.
    UnexpectedEof,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BadStatusLine => write!(f, "malformed status line"),
            Self::BadHeader => write!(f, "malformed header"),
            Self::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            Self::BadContentLength => write!(f, "invalid Content-Length"),
            Self::BadChunkedEncoding => write!(f, "malformed chunked encoding"),
            Self::HeadersTooLarge => write!(f, "header block too large"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::BodyTooLarge => write!(f, "body exceeds size limit"),
            Self::AmbiguousBodyLength => {
                write!(f, "both Content-Length and Transfer-Encoding present")
            }
            Self::UnexpectedEof => write!(f, "connection closed mid-response"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// HTTP version observed on a response status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Version {
    Http10,
    Http11,
}

impl Version {
    fn from_bytes(src: &[u8]) -> Option<Self> {
        match src {
            b"HTTP/1.0" => Some(Self::Http10),
            b"HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }
}

/// A fully decoded HTTP response.
#[derive(Debug)]
pub(crate) struct HttpResponse {
    /// Status code from the status line.
    pub status: u16,
    /// Raw head block (status line + header lines), as received.
    pub head_text: String,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// False when the connection must be closed after this response.
    pub keep_alive: bool,
}

/// Serializes a request into its on-wire form.
///
/// The request line carries the percent-encoded query string. `Host` and
/// `Accept: */*` are always present, except that a caller-supplied `Accept`
/// header wins and no duplicate is emitted. `Content-Type` and
/// `Content-Length` are added for requests with content. Caller headers
/// follow the mandatory ones verbatim, in the order supplied.
pub(crate) fn encode_request(req: &Request, authority: &str) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);

    out.extend_from_slice(req.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(req.resource.as_bytes());
    if !req.query_params.is_empty() {
        out.extend_from_slice(b"?");
        out.extend_from_slice(encode_query(&req.query_params).as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(authority.as_bytes());
    out.extend_from_slice(b"\r\n");

    let caller_overrides_accept = req
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("accept"));
    if !caller_overrides_accept {
        out.extend_from_slice(b"Accept: */*\r\n");
    }

    if let Some(content) = &req.content {
        out.extend_from_slice(b"Content-Type: ");
        out.extend_from_slice(content.mime_type.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(content.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    for (name, value) in &req.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");

    if let Some(content) = &req.content {
        out.extend_from_slice(&content.body);
    }

    out
}

/// Chunked transfer decoding sub-state.
#[derive(Debug)]
enum ChunkState {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

/// Decoder state across calls to [`ResponseDecoder::push`].
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the complete head block.
    Head,
    /// Reading exactly `remaining` body bytes.
    Body { remaining: usize },
    /// Reading a chunked body.
    Chunked(ChunkState),
    /// Body is delimited by EOF.
    Eof,
    /// A response has been produced.
    Done,
}

/// Parsed response head, held while the body is being read.
#[derive(Debug, Default)]
struct Head {
    status: u16,
    head_text: String,
    headers: Vec<(String, String)>,
    keep_alive: bool,
}

/// Incremental HTTP/1.1 response decoder.
///
/// One decoder instance handles exactly one response; the connection creates
/// a fresh decoder per assigned request. Feed bytes with [`push`](Self::push)
/// and report a peer close with [`finish_eof`](Self::finish_eof).
#[derive(Debug)]
pub(crate) struct ResponseDecoder {
    state: DecodeState,
    buf: BytesMut,
    head: Head,
    body: BytesMut,
    /// True when a response without explicit framing has an empty body
    /// (responses to DELETE).
    head_only_default: bool,
}

impl ResponseDecoder {
    /// Creates a decoder for a response to the given request method.
    pub(crate) fn new(method: Method) -> Self {
        Self {
            state: DecodeState::Head,
            buf: BytesMut::new(),
            head: Head::default(),
            body: BytesMut::new(),
            head_only_default: method.response_body_needs_framing(),
        }
    }

    /// Returns true once the head block has been parsed.
    pub(crate) fn has_head(&self) -> bool {
        !matches!(self.state, DecodeState::Head)
    }

    /// Feeds received bytes; returns a response once one is complete.
    pub(crate) fn push(
        &mut self,
        data: &[u8],
    ) -> Result<Option<HttpResponse>, ProtocolError> {
        self.buf.extend_from_slice(data);
        self.advance()
    }

    /// Reports that the peer closed the connection.
    ///
    /// An EOF-delimited body completes here; a clean close with no response
    /// yields `Ok(None)`; a close mid-head or mid-body is an error.
    pub(crate) fn finish_eof(&mut self) -> Result<Option<HttpResponse>, ProtocolError> {
        match self.state {
            DecodeState::Eof => {
                let rest = self.buf.split();
                self.body.extend_from_slice(&rest);
                if self.body.len() > MAX_BODY_SIZE {
                    return Err(ProtocolError::BodyTooLarge);
                }
                self.head.keep_alive = false;
                self.state = DecodeState::Done;
                Ok(Some(self.take_response()))
            }
            DecodeState::Head if self.buf.is_empty() => Ok(None),
            DecodeState::Done => Ok(None),
            _ => Err(ProtocolError::UnexpectedEof),
        }
    }

    fn advance(&mut self) -> Result<Option<HttpResponse>, ProtocolError> {
        loop {
            match &mut self.state {
                DecodeState::Head => {
                    let Some(end) = find_headers_end(self.buf.as_ref()) else {
                        if self.buf.len() > MAX_HEADERS_SIZE {
                            return Err(ProtocolError::HeadersTooLarge);
                        }
                        return Ok(None);
                    };
                    if end > MAX_HEADERS_SIZE {
                        return Err(ProtocolError::HeadersTooLarge);
                    }
                    let head_bytes = self.buf.split_to(end);
                    self.parse_head(head_bytes.as_ref())?;

                    // RFC 9110: a 1xx head is interim. Discard it and keep
                    // reading for the final status line on this connection.
                    if matches!(self.head.status, 100..=199) {
                        self.head = Head::default();
                        continue;
                    }

                    // RFC 7230/9110: these statuses never carry a body.
                    if matches!(self.head.status, 204 | 304) {
                        self.state = DecodeState::Done;
                        return Ok(Some(self.take_response()));
                    }

                    let te = unique_header(&self.head.headers, "Transfer-Encoding");
                    let cl = unique_header(&self.head.headers, "Content-Length");
                    if te.is_some() && cl.is_some() {
                        return Err(ProtocolError::AmbiguousBodyLength);
                    }

                    if let Some(te) = te {
                        if !te.eq_ignore_ascii_case("chunked") {
                            return Err(ProtocolError::BadChunkedEncoding);
                        }
                        self.state = DecodeState::Chunked(ChunkState::SizeLine);
                        continue;
                    }

                    if let Some(cl) = cl {
                        let remaining: usize = cl
                            .trim()
                            .parse()
                            .map_err(|_| ProtocolError::BadContentLength)?;
                        if remaining > MAX_BODY_SIZE {
                            return Err(ProtocolError::BodyTooLarge);
                        }
                        if remaining == 0 {
                            self.state = DecodeState::Done;
                            return Ok(Some(self.take_response()));
                        }
                        self.state = DecodeState::Body { remaining };
                        continue;
                    }

                    if self.head_only_default {
                        self.state = DecodeState::Done;
                        return Ok(Some(self.take_response()));
                    }

                    self.state = DecodeState::Eof;
                    continue;
                }

                DecodeState::Body { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = self.buf.len().min(*remaining);
                    let chunk = self.buf.split_to(take);
                    self.body.extend_from_slice(chunk.as_ref());
                    *remaining -= take;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    self.state = DecodeState::Done;
                    return Ok(Some(self.take_response()));
                }

                DecodeState::Chunked(chunk_state) => match chunk_state {
                    ChunkState::SizeLine => {
                        let Some(line_end) = find_crlf(self.buf.as_ref()) else {
                            if self.buf.len() > MAX_HEADERS_SIZE {
                                return Err(ProtocolError::BadChunkedEncoding);
                            }
                            return Ok(None);
                        };
                        let line = std::str::from_utf8(&self.buf.as_ref()[..line_end])
                            .map_err(|_| ProtocolError::BadChunkedEncoding)?;
                        // Chunk extensions (";key=value") are ignored.
                        let size_part = line.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_part, 16)
                            .map_err(|_| ProtocolError::BadChunkedEncoding)?;
                        let _ = self.buf.split_to(line_end + 2);
                        if size == 0 {
                            self.state = DecodeState::Chunked(ChunkState::Trailers);
                        } else {
                            if self.body.len() + size > MAX_BODY_SIZE {
                                return Err(ProtocolError::BodyTooLarge);
                            }
                            self.state =
                                DecodeState::Chunked(ChunkState::Data { remaining: size });
                        }
                    }
                    ChunkState::Data { remaining } => {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        let take = self.buf.len().min(*remaining);
                        let chunk = self.buf.split_to(take);
                        self.body.extend_from_slice(chunk.as_ref());
                        *remaining -= take;
                        if *remaining == 0 {
                            self.state = DecodeState::Chunked(ChunkState::DataCrlf);
                        } else {
                            return Ok(None);
                        }
                    }
                    ChunkState::DataCrlf => {
                        if self.buf.len() < 2 {
                            return Ok(None);
                        }
                        if &self.buf.as_ref()[..2] != b"\r\n" {
                            return Err(ProtocolError::BadChunkedEncoding);
                        }
                        let _ = self.buf.split_to(2);
                        self.state = DecodeState::Chunked(ChunkState::SizeLine);
                    }
                    ChunkState::Trailers => {
                        let Some(line_end) = find_crlf(self.buf.as_ref()) else {
                            if self.buf.len() > MAX_HEADERS_SIZE {
                                return Err(ProtocolError::HeadersTooLarge);
                            }
                            return Ok(None);
                        };
                        let line = self.buf.split_to(line_end);
                        let _ = self.buf.split_to(2);
                        if line.is_empty() {
                            self.state = DecodeState::Done;
                            return Ok(Some(self.take_response()));
                        }
                        // Trailer fields are consumed and discarded.
                    }
                },

                DecodeState::Eof => {
                    let rest = self.buf.split();
                    self.body.extend_from_slice(&rest);
                    if self.body.len() > MAX_BODY_SIZE {
                        return Err(ProtocolError::BodyTooLarge);
                    }
                    return Ok(None);
                }

                DecodeState::Done => return Ok(None),
            }
        }
    }

    fn parse_head(&mut self, head_bytes: &[u8]) -> Result<(), ProtocolError> {
        // head_bytes includes the terminating \r\n\r\n.
        let text = std::str::from_utf8(head_bytes).map_err(|_| ProtocolError::BadStatusLine)?;
        let raw = text.trim_end_matches("\r\n").to_owned();

        let mut lines = text.split("\r\n");
        let status_line = lines.next().ok_or(ProtocolError::BadStatusLine)?;
        let (version, status) = parse_status_line(status_line)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            headers.push(parse_header_line(line)?);
            if headers.len() > MAX_HEADERS {
                return Err(ProtocolError::TooManyHeaders);
            }
        }

        let connection = unique_header(&headers, "Connection");
        let keep_alive = match version {
            Version::Http11 => {
                !connection.is_some_and(|v| v.eq_ignore_ascii_case("close"))
            }
            Version::Http10 => {
                connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            }
        };

        self.head = Head {
            status,
            head_text: raw,
            headers,
            keep_alive,
        };
        Ok(())
    }

    fn take_response(&mut self) -> HttpResponse {
        let head = std::mem::take(&mut self.head);
        HttpResponse {
            status: head.status,
            head_text: head.head_text,
            body: std::mem::take(&mut self.body).to_vec(),
            keep_alive: head.keep_alive,
        }
    }
}

/// Finds the end of the head block; returns the index just past `\r\n\r\n`.
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses a status line such as `HTTP/1.1 200 OK`.
fn parse_status_line(line: &str) -> Result<(Version, u16), ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or(ProtocolError::BadStatusLine)?;
    let code = parts.next().ok_or(ProtocolError::BadStatusLine)?;
    let version =
        Version::from_bytes(version.as_bytes()).ok_or(ProtocolError::UnsupportedVersion)?;
    let status: u16 = code.parse().map_err(|_| ProtocolError::BadStatusLine)?;
    Ok((version, status))
}

/// Parses a single `Name: value` header line.
fn parse_header_line(line: &str) -> Result<(String, String), ProtocolError> {
    let (name, value) = line.split_once(':').ok_or(ProtocolError::BadHeader)?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

/// Returns the value of the named header, if present exactly once or not at
/// all; repeated values collapse to the first occurrence.
fn unique_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

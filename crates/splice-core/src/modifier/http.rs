//! HTTP/1.x message rewriting
//!
//! Requests flow through the Alice loop and responses through the Bob
//! loop. Every message is read completely, its body de-chunked and
//! optionally decompressed, rewritten, and re-emitted with a
//! `Content-Length` matching the new body and no `Transfer-Encoding`.
//!
//! A request asking for an upgrade (or a CONNECT) holds back further
//! requests until its response arrives. A `101 Switching Protocols`, or a
//! 2xx answering CONNECT, turns both directions into a raw byte relay.

use super::replace::{ReplaceTransform, ReplacementRule};
use super::{NetworkStreamModifier, ParseError, Side, StreamTransform};
use crate::error::{Error, Result};
use crate::stream::{MessageReader, NetworkStream};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use httparse::{Request, Response, Status, EMPTY_HEADER};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum number of headers per message
const MAX_HEADERS: usize = 100;

/// Longest accepted chunk-size line
const MAX_CHUNK_LINE: usize = 1024;

/// First line of an HTTP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD target HTTP/1.x`
    Request {
        /// Request method
        method: String,
        /// Request target
        target: String,
        /// Minor version
        version: u8,
    },
    /// `HTTP/1.x status reason`
    Response {
        /// Minor version
        version: u8,
        /// Status code
        status: u16,
        /// Reason phrase
        reason: String,
    },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                target,
                version,
            } => write!(f, "{method} {target} HTTP/1.{version}"),
            StartLine::Response {
                version,
                status,
                reason,
            } => write!(f, "HTTP/1.{version} {status} {reason}"),
        }
    }
}

/// A fully read HTTP message with a decoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    /// Request or status line
    pub start: StartLine,
    /// Headers in wire order
    pub headers: Vec<(String, String)>,
    /// Body after de-chunking and decompression
    pub body: Bytes,
}

impl HttpMessage {
    /// Whether this is a request
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of a header with one value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.headers[pos].1 = value;
                let mut index = 0;
                self.headers.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Remove every value of a header
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Serialize as it would appear on the wire
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(self.start.to_string().as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}

/// Host hook for editing messages in flight
pub trait HttpRewriter: Send + Sync {
    /// Edit a request; return `false` to drop it
    fn rewrite_request(&self, request: &mut HttpMessage) -> bool {
        let _ = request;
        true
    }

    /// Edit a response; return `false` to drop it
    fn rewrite_response(&self, response: &mut HttpMessage) -> bool {
        let _ = response;
        true
    }
}

/// Behaviour switches of an [`HttpStreamOperator`]
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Decode gzip/deflate bodies and drop `Content-Encoding`
    pub decompress: bool,
    /// Remove `Accept-Encoding` from requests so servers answer uncompressed
    pub strip_accept_encoding: bool,
    /// Upper bound for the header block
    pub max_header_bytes: usize,
    /// Body replacements, bound to a direction each
    pub replacements: Vec<ReplacementRule>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            decompress: true,
            strip_accept_encoding: false,
            max_header_bytes: 64 * 1024,
            replacements: Vec::new(),
        }
    }
}

/// How a message body was delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body by definition
    Bodiless,
    /// `Content-Length`
    Length,
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Response ending with the connection
    Close,
}

/// One unit read by an [`HttpTransform`]
#[derive(Debug)]
pub struct ParsedMessage(Parsed);

#[derive(Debug)]
enum Parsed {
    /// A message plus how its body was delimited
    Http { message: HttpMessage, framing: Framing },
    /// Bytes of a switched connection
    Raw(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Http,
    /// An upgrade or CONNECT request went out; requests wait for its answer
    AwaitingVerdict,
    /// Both directions relay raw bytes
    Tunnel,
}

#[derive(Default)]
struct ExchangeState {
    // Methods of forwarded requests, oldest first; HEAD responses carry no body
    methods: VecDeque<String>,
    mode: Mode,
    responses_done: bool,
}

/// Bookkeeping shared by the request and response directions
#[derive(Default)]
struct Exchange {
    state: Mutex<ExchangeState>,
    verdict: Condvar,
}

impl Exchange {
    fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Mode once a pending upgrade has been answered
    fn settled_mode(&self) -> Mode {
        let mut state = self.state.lock();
        while state.mode == Mode::AwaitingVerdict {
            self.verdict.wait(&mut state);
        }
        state.mode
    }

    fn request_forwarded(&self, method: &str, upgrade: bool) {
        let mut state = self.state.lock();
        state.methods.push_back(method.to_string());
        if upgrade && !state.responses_done {
            state.mode = Mode::AwaitingVerdict;
        }
    }

    /// Pop the method a final response answers and settle a pending upgrade
    fn response_arrived(&self, status: u16) -> (Option<String>, bool) {
        let mut state = self.state.lock();
        let method = state.methods.pop_front();
        let connect = method.as_deref().is_some_and(|m| m.eq_ignore_ascii_case("CONNECT"));
        let switched = status == 101 || (connect && (200..300).contains(&status));
        if switched {
            state.mode = Mode::Tunnel;
        } else if state.mode == Mode::AwaitingVerdict {
            state.mode = Mode::Http;
        }
        drop(state);
        self.verdict.notify_all();
        (method, switched)
    }

    fn responses_done(&self) {
        let mut state = self.state.lock();
        state.responses_done = true;
        if state.mode == Mode::AwaitingVerdict {
            state.mode = Mode::Http;
        }
        drop(state);
        self.verdict.notify_all();
    }
}

/// HTTP-aware stream modifier factory
#[derive(Clone, Default)]
pub struct HttpStreamOperator {
    options: HttpOptions,
    rewriter: Option<Arc<dyn HttpRewriter>>,
}

impl HttpStreamOperator {
    /// Operator with the given options
    pub fn new(options: HttpOptions) -> Self {
        Self {
            options,
            rewriter: None,
        }
    }

    /// Install a rewrite hook
    pub fn with_rewriter(mut self, rewriter: Arc<dyn HttpRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Build both directional transforms; they share request bookkeeping
    pub fn transforms(&self) -> (HttpTransform, HttpTransform) {
        let options = Arc::new(self.options.clone());
        let exchange = Arc::new(Exchange::default());
        let make = |side| HttpTransform {
            side,
            options: options.clone(),
            rewriter: self.rewriter.clone(),
            exchange: exchange.clone(),
        };
        (make(Side::Alice), make(Side::Bob))
    }

    /// Build the modifier relaying between `alice` (client) and `bob` (server)
    pub fn into_modifier(
        self,
        name: impl Into<String>,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
    ) -> NetworkStreamModifier {
        let (requests, responses) = self.transforms();
        NetworkStreamModifier::new(name, alice, bob, requests, responses)
    }
}

impl fmt::Debug for HttpStreamOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamOperator")
            .field("options", &self.options)
            .field("rewriter", &self.rewriter.is_some())
            .finish()
    }
}

/// One direction of an [`HttpStreamOperator`]
pub struct HttpTransform {
    side: Side,
    options: Arc<HttpOptions>,
    rewriter: Option<Arc<dyn HttpRewriter>>,
    exchange: Arc<Exchange>,
}

impl Drop for HttpTransform {
    fn drop(&mut self) {
        // No verdict can come once the response loop is gone
        if self.side == Side::Bob {
            self.exchange.responses_done();
        }
    }
}

fn malformed(message: impl Into<String>) -> Error {
    ParseError::malformed("HTTP", message).into()
}

impl HttpTransform {
    fn read_head(&self, reader: &mut MessageReader) -> Result<BytesMut> {
        let limit = self.options.max_header_bytes;
        let mut head = BytesMut::new();

        // Tolerate stray CRLFs between messages
        let mut line = reader.read_line(limit)?;
        while line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
            line = reader.read_line(limit)?;
        }
        loop {
            head.put_slice(&line);
            if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
                return Ok(head);
            }
            if head.len() > limit {
                return Err(malformed(format!("header block exceeds {limit} bytes")));
            }
            line = reader.read_line(limit)?;
        }
    }

    fn parse_head(&self, head: &[u8]) -> Result<HttpMessage> {
        let mut slots = [EMPTY_HEADER; MAX_HEADERS];
        let (start, parsed) = match self.side {
            Side::Alice => {
                let mut req = Request::new(&mut slots);
                match req.parse(head) {
                    Ok(Status::Complete(_)) => {}
                    Ok(Status::Partial) => return Err(malformed("incomplete request head")),
                    Err(e) => return Err(malformed(format!("bad request head: {e}"))),
                }
                let start = StartLine::Request {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    version: req.version.unwrap_or(1),
                };
                (start, collect_headers(req.headers))
            }
            Side::Bob => {
                let mut resp = Response::new(&mut slots);
                match resp.parse(head) {
                    Ok(Status::Complete(_)) => {}
                    Ok(Status::Partial) => return Err(malformed("incomplete response head")),
                    Err(e) => return Err(malformed(format!("bad response head: {e}"))),
                }
                let start = StartLine::Response {
                    version: resp.version.unwrap_or(1),
                    status: resp.code.unwrap_or_default(),
                    reason: resp.reason.unwrap_or_default().to_string(),
                };
                (start, collect_headers(resp.headers))
            }
        };
        Ok(HttpMessage {
            start,
            headers: parsed,
            body: Bytes::new(),
        })
    }

    fn framing(&self, message: &HttpMessage) -> Result<Framing> {
        if let StartLine::Response { status, .. } = message.start {
            if (100..200).contains(&status) && status != 101 {
                return Ok(Framing::Bodiless);
            }
            let (method, switched) = self.exchange.response_arrived(status);
            if switched {
                debug!(side = %self.side, status, "Connection switched to raw relay");
                return Ok(Framing::Bodiless);
            }
            let head_reply = method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
            if status == 204 || status == 304 || head_reply {
                return Ok(Framing::Bodiless);
            }
        }

        let chunked = message
            .header("Transfer-Encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Ok(Framing::Chunked);
        }
        if let Some(value) = message.header("Content-Length") {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| malformed(format!("invalid Content-Length '{value}'")))?;
            return Ok(Framing::Length);
        }
        Ok(if message.is_request() {
            Framing::Bodiless
        } else {
            Framing::Close
        })
    }

    fn read_body(
        &self,
        reader: &mut MessageReader,
        message: &HttpMessage,
        framing: Framing,
    ) -> Result<Bytes> {
        match framing {
            Framing::Bodiless => Ok(Bytes::new()),
            Framing::Length => {
                let len = message
                    .header("Content-Length")
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                reader.read_exact(len)
            }
            Framing::Chunked => read_chunked(reader),
            Framing::Close => reader.read_to_end(),
        }
    }

    fn decode_body(&self, message: &mut HttpMessage) -> Result<()> {
        if !self.options.decompress || message.body.is_empty() {
            return Ok(());
        }
        let encoding = message
            .header("Content-Encoding")
            .map(|e| e.trim().to_ascii_lowercase());
        let Some(encoding) = encoding else {
            return Ok(());
        };
        let decoded = match encoding.as_str() {
            "gzip" | "x-gzip" => decompress(GzDecoder::new(message.body.as_ref()), &encoding)?,
            // "deflate" is zlib-wrapped by the standard, raw in practice often enough
            "deflate" => decompress(ZlibDecoder::new(message.body.as_ref()), &encoding)
                .or_else(|_| decompress(DeflateDecoder::new(message.body.as_ref()), &encoding))?,
            "identity" => message.body.to_vec(),
            _ => return Ok(()),
        };
        trace!(%encoding, from = message.body.len(), to = decoded.len(), "Body decoded");
        message.body = Bytes::from(decoded);
        message.remove_header("Content-Encoding");
        Ok(())
    }

    fn replace_body(&self, message: &mut HttpMessage) {
        if message.body.is_empty() || message.header("Content-Encoding").is_some() {
            return;
        }
        let rules: Vec<_> = self
            .options
            .replacements
            .iter()
            .filter(|r| r.direction.applies_to(self.side))
            .map(|r| (r.find.clone(), r.replace.clone()))
            .collect();
        if rules.is_empty() {
            return;
        }
        let mut window = ReplaceTransform::new(rules);
        let mut body = BytesMut::from(window.process(&message.body).as_ref());
        body.put_slice(&window.flush());
        if window.replacements() > 0 {
            debug!(side = %self.side, count = window.replacements(), "Body rewritten");
        }
        message.body = body.freeze();
    }
}

impl StreamTransform for HttpTransform {
    type Message = ParsedMessage;

    fn read_message(&mut self, reader: &mut MessageReader) -> Result<ParsedMessage> {
        let mode = match self.side {
            Side::Alice => self.exchange.settled_mode(),
            Side::Bob => self.exchange.mode(),
        };
        if mode == Mode::Tunnel {
            let chunk = reader.take_available()?.ok_or(ParseError::StreamEnded)?;
            return Ok(ParsedMessage(Parsed::Raw(chunk)));
        }

        let head = self.read_head(reader)?;
        let mut message = self.parse_head(&head)?;
        let framing = self.framing(&message)?;
        message.body = self.read_body(reader, &message, framing)?;
        trace!(
            side = %self.side,
            start = %message.start,
            ?framing,
            body = message.body.len(),
            "HTTP message read"
        );
        Ok(ParsedMessage(Parsed::Http { message, framing }))
    }

    fn transform(&mut self, parsed: ParsedMessage) -> Result<Option<Bytes>> {
        let (mut message, framing) = match parsed.0 {
            Parsed::Raw(chunk) => return Ok(Some(chunk)),
            Parsed::Http { message, framing } => (message, framing),
        };

        self.decode_body(&mut message)?;
        if message.is_request() && self.options.strip_accept_encoding {
            message.remove_header("Accept-Encoding");
        }
        self.replace_body(&mut message);

        if let Some(rewriter) = &self.rewriter {
            let keep = if message.is_request() {
                rewriter.rewrite_request(&mut message)
            } else {
                rewriter.rewrite_response(&mut message)
            };
            if !keep {
                debug!(side = %self.side, start = %message.start, "HTTP message dropped");
                return Ok(None);
            }
        }

        // Only forwarded requests get a response to pair with
        if let StartLine::Request { method, .. } = &message.start {
            let upgrade =
                method.eq_ignore_ascii_case("CONNECT") || message.header("Upgrade").is_some();
            self.exchange.request_forwarded(method, upgrade);
        }

        if framing != Framing::Bodiless || !message.body.is_empty() {
            message.remove_header("Transfer-Encoding");
            message.set_header("Content-Length", message.body.len().to_string());
        }
        Ok(Some(message.to_bytes()))
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

fn read_chunked(reader: &mut MessageReader) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let line = reader.read_line(MAX_CHUNK_LINE)?;
        let text = std::str::from_utf8(&line).map_err(|_| malformed("chunk size is not text"))?;
        // Chunk extensions follow a semicolon
        let size_part = text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_part, 16)
            .map_err(|_| malformed(format!("invalid chunk size '{size_part}'")))?;
        if size == 0 {
            break;
        }
        body.put_slice(&reader.read_exact(size)?);
        let terminator = reader.read_line(MAX_CHUNK_LINE)?;
        if terminator.as_ref() != b"\r\n" && terminator.as_ref() != b"\n" {
            return Err(malformed("chunk not terminated by CRLF"));
        }
    }
    // Trailers are dropped with the chunked encoding
    loop {
        let line = reader.read_line(MAX_CHUNK_LINE)?;
        if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
            return Ok(body.freeze());
        }
    }
}

fn decompress(mut decoder: impl Read, encoding: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| Error::Decode {
        encoding: encoding.to_string(),
        message: e.to_string(),
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn reader_over(data: &[u8]) -> MessageReader {
        let (writer, reader) = pipe();
        writer.write_all(data).unwrap();
        writer.shutdown_write().unwrap();
        MessageReader::new(Arc::new(reader))
    }

    fn relay(t: &mut HttpTransform, data: &[u8]) -> Vec<u8> {
        let mut reader = reader_over(data);
        let mut out = Vec::new();
        loop {
            match t.read_message(&mut reader) {
                Ok(message) => {
                    if let Some(bytes) = t.transform(message).unwrap() {
                        out.extend_from_slice(&bytes);
                    }
                }
                Err(Error::Parse(ParseError::StreamEnded)) => return out,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    fn parse_response(bytes: &[u8]) -> (Vec<(String, String)>, Vec<u8>) {
        let mut slots = [EMPTY_HEADER; 32];
        let mut resp = Response::new(&mut slots);
        let Ok(Status::Complete(n)) = resp.parse(bytes) else {
            panic!("not a complete response");
        };
        (collect_headers(resp.headers), bytes[n..].to_vec())
    }

    #[test]
    fn test_chunked_response_is_dechunked() {
        let (_, mut responses) = HttpStreamOperator::default().transforms();
        let out = relay(
            &mut responses,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );
        let (headers, body) = parse_response(&out);
        assert_eq!(body, b"hello world");
        assert!(headers.iter().any(|(n, v)| n == "Content-Length" && v == "11"));
        assert!(!headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("Transfer-Encoding")));
    }

    #[test]
    fn test_gzip_body_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed text").unwrap();
        let gz = encoder.finish().unwrap();

        let mut input = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        input.extend_from_slice(&gz);

        let (_, mut responses) = HttpStreamOperator::default().transforms();
        let out = relay(&mut responses, &input);
        let (headers, body) = parse_response(&out);
        assert_eq!(body, b"compressed text");
        assert!(!headers.iter().any(|(n, _)| n == "Content-Encoding"));
    }

    #[test]
    fn test_keep_alive_requests_and_stripping() {
        let options = HttpOptions {
            strip_accept_encoding: true,
            ..HttpOptions::default()
        };
        let (mut requests, _) = HttpStreamOperator::new(options).transforms();
        let out = relay(
            &mut requests,
            b"GET / HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\n\r\n\
              POST /p HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc",
        );
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "GET / HTTP/1.1\r\nHost: a\r\n\r\n\
             POST /p HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn test_head_response_has_no_body() {
        let (mut requests, mut responses) = HttpStreamOperator::default().transforms();
        relay(&mut requests, b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\n");
        let out = relay(
            &mut responses,
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nHTTP/1.1 204"));
    }

    #[test]
    fn test_close_delimited_response_gets_length() {
        let (_, mut responses) = HttpStreamOperator::default().transforms();
        let out = relay(&mut responses, b"HTTP/1.0 200 OK\r\n\r\nuntil close");
        let (headers, body) = parse_response(&out);
        assert_eq!(body, b"until close");
        assert!(headers.iter().any(|(n, v)| n == "Content-Length" && v == "11"));
    }

    #[test]
    fn test_body_replacement_updates_length() {
        let options = HttpOptions {
            replacements: vec![ReplacementRule::new("world", "there, friend").unwrap()],
            ..HttpOptions::default()
        };
        let (_, mut responses) = HttpStreamOperator::new(options).transforms();
        let out = relay(
            &mut responses,
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world",
        );
        let (headers, body) = parse_response(&out);
        assert_eq!(body, b"hello there, friend");
        assert!(headers.iter().any(|(n, v)| n == "Content-Length" && v == "19"));
    }

    struct DropAdmin;

    impl HttpRewriter for DropAdmin {
        fn rewrite_request(&self, request: &mut HttpMessage) -> bool {
            request.set_header("X-Intercepted", "1");
            !matches!(
                &request.start,
                StartLine::Request { target, .. } if target.starts_with("/admin")
            )
        }
    }

    #[test]
    fn test_rewriter_edits_and_drops() {
        let operator = HttpStreamOperator::default().with_rewriter(Arc::new(DropAdmin));
        let (mut requests, _) = operator.transforms();
        let out = relay(
            &mut requests,
            b"GET /admin HTTP/1.1\r\nHost: a\r\n\r\nGET /ok HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "GET /ok HTTP/1.1\r\nHost: a\r\nX-Intercepted: 1\r\n\r\n"
        );
    }

    struct DropHead;

    impl HttpRewriter for DropHead {
        fn rewrite_request(&self, request: &mut HttpMessage) -> bool {
            !matches!(&request.start, StartLine::Request { method, .. } if method == "HEAD")
        }
    }

    #[test]
    fn test_dropped_request_does_not_frame_responses() {
        let operator = HttpStreamOperator::default().with_rewriter(Arc::new(DropHead));
        let (mut requests, mut responses) = operator.transforms();
        relay(
            &mut requests,
            b"HEAD /skip HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        // The only response answers the GET, so its body is read
        let out = relay(&mut responses, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody");
        let (_, body) = parse_response(&out);
        assert_eq!(body, b"body");
    }

    #[test]
    fn test_switching_protocols_turns_raw() {
        let (_, mut responses) = HttpStreamOperator::default().transforms();
        let out = relay(
            &mut responses,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x05hello",
        );
        assert_eq!(
            out,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x05hello"
        );
    }

    #[test]
    fn test_rejected_upgrade_keeps_parsing() {
        let (requests, mut responses) = HttpStreamOperator::default().transforms();
        requests.exchange.request_forwarded("GET", true);
        let out = relay(
            &mut responses,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nnoHTTP/1.1 204 No Content\r\n\r\n",
        );
        assert!(String::from_utf8(out).unwrap().ends_with("HTTP/1.1 204 No Content\r\n\r\n"));
        assert_eq!(requests.exchange.settled_mode(), Mode::Http);
    }

    #[test]
    fn test_malformed_chunk_size() {
        let (_, mut responses) = HttpStreamOperator::default().transforms();
        let mut reader =
            reader_over(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        assert!(matches!(
            responses.read_message(&mut reader),
            Err(Error::Parse(ParseError::Malformed { .. }))
        ));
    }

    #[test]
    fn test_set_header_collapses_duplicates() {
        let mut message = HttpMessage {
            start: StartLine::Response {
                version: 1,
                status: 200,
                reason: "OK".into(),
            },
            headers: vec![
                ("content-length".into(), "1".into()),
                ("X".into(), "y".into()),
                ("Content-Length".into(), "2".into()),
            ],
            body: Bytes::new(),
        };
        message.set_header("Content-Length", "5");
        assert_eq!(
            message.headers,
            vec![
                ("content-length".to_string(), "5".to_string()),
                ("X".to_string(), "y".to_string())
            ]
        );
    }
}

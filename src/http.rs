use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::HttpError;

/// Whether an editor surface works on requests or responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::Request, MessageKind::Response];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network endpoint a message was sent to or received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HttpService {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl HttpService {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Build a service from an absolute URL, using the scheme's default port when none is given.
    pub fn from_url(raw: &str) -> Result<Self, HttpError> {
        let url = Url::parse(raw).map_err(|e| HttpError::InvalidUrl(format!("{raw}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl(format!("{raw}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl(format!("{raw}: unknown port")))?;
        Ok(Self::new(host, port, url.scheme() == "https"))
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }
}

impl fmt::Display for HttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// A raw HTTP/1 request or response, owned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    kind: MessageKind,
    raw: Vec<u8>,
}

/// Head and body of an [`HttpMessage`], split apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedMessage {
    /// Method, target and version for requests; version, status and reason for responses.
    pub fn start_parts(&self) -> (String, String, String) {
        let mut parts = self.start_line.splitn(3, ' ');
        let a = parts.next().unwrap_or_default().to_string();
        let b = parts.next().unwrap_or_default().to_string();
        let c = parts.next().unwrap_or_default().to_string();
        (a, b, c)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

const HEAD_END: &[u8] = b"\r\n\r\n";

impl HttpMessage {
    pub fn new(kind: MessageKind, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            raw: raw.into(),
        }
    }

    pub fn request(raw: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Request, raw)
    }

    pub fn response(raw: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Response, raw)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Split the message into start line, headers and body.
    ///
    /// Accepts bare `\n` line endings in the head, which hand-written message files often use.
    pub fn parse(&self) -> Result<ParsedMessage, HttpError> {
        if self.raw.is_empty() {
            return Err(HttpError::Malformed("empty message".into()));
        }

        let (head, body) = match find(&self.raw, HEAD_END) {
            Some(pos) => (&self.raw[..pos], &self.raw[pos + HEAD_END.len()..]),
            None => match find(&self.raw, b"\n\n") {
                Some(pos) => (&self.raw[..pos], &self.raw[pos + 2..]),
                None => (&self.raw[..], &[][..]),
            },
        };

        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines();
        let start_line = lines
            .next()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HttpError::Malformed("missing start line".into()))?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("invalid header line `{line}`")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(ParsedMessage {
            start_line,
            headers,
            body: body.to_vec(),
        })
    }

    /// Rebuild a message from its parts. `Content-Length` is rewritten when present.
    pub fn from_parts(
        kind: MessageKind,
        start_line: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Self {
        let mut raw = Vec::with_capacity(start_line.len() + body.len() + 64);
        raw.extend_from_slice(start_line.as_bytes());
        raw.extend_from_slice(b"\r\n");
        for (name, value) in headers {
            let value = if name.eq_ignore_ascii_case("content-length") {
                body.len().to_string()
            } else {
                value.clone()
            };
            raw.extend_from_slice(name.as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(body);
        Self { kind, raw }
    }

    /// Service derived from the `Host` header, used when the host did not provide one.
    pub fn service_from_host_header(&self) -> Option<HttpService> {
        let parsed = self.parse().ok()?;
        let host = parsed.header("host")?;
        match host.rsplit_once(':') {
            Some((name, port)) => port
                .parse()
                .ok()
                .map(|port| HttpService::new(name, port, port == 443)),
            None => Some(HttpService::new(host, 80, false)),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Host tool an editor was opened in or a request originated from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Proxy,
    Repeater,
    Intruder,
    Scanner,
    Extensions,
    Other(String),
}

impl ToolSource {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "proxy" => ToolSource::Proxy,
            "repeater" => ToolSource::Repeater,
            "intruder" => ToolSource::Intruder,
            "scanner" => ToolSource::Scanner,
            "extensions" => ToolSource::Extensions,
            other => ToolSource::Other(other.to_string()),
        }
    }
}

/// Whether the host lets the user edit the message at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditorMode {
    #[default]
    Default,
    ReadOnly,
}

/// Where an editor surface was created. Recorded once and used to correlate outbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditorContext {
    pub tool: ToolSource,
    pub mode: EditorMode,
}

impl EditorContext {
    pub fn new(tool: ToolSource, mode: EditorMode) -> Self {
        Self { tool, mode }
    }

    /// A request only matches editors opened in the tool that is sending it.
    pub fn matches(&self, tool: &ToolSource) -> bool {
        &self.tool == tool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET: &[u8] = b"GET /a?b=c HTTP/1.1\r\nHost: example.com:8443\r\nX-Test: 1\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let msg = HttpMessage::request(GET);
        let parsed = msg.parse().unwrap();
        assert_eq!(parsed.start_line, "GET /a?b=c HTTP/1.1");
        assert_eq!(parsed.header("x-test"), Some("1"));
        assert!(parsed.body.is_empty());

        let (method, path, version) = parsed.start_parts();
        assert_eq!((method.as_str(), path.as_str(), version.as_str()), ("GET", "/a?b=c", "HTTP/1.1"));
    }

    #[test]
    fn test_parse_response_keeps_reason_with_spaces() {
        let msg = HttpMessage::response(&b"HTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\nno"[..]);
        let parsed = msg.parse().unwrap();
        let (_, status, reason) = parsed.start_parts();
        assert_eq!(status, "404");
        assert_eq!(reason, "Not Found");
        assert_eq!(parsed.body, b"no");
    }

    #[test]
    fn test_from_parts_rewrites_content_length() {
        let headers = vec![
            ("Host".to_string(), "x".to_string()),
            ("Content-Length".to_string(), "1".to_string()),
        ];
        let msg = HttpMessage::from_parts(MessageKind::Request, "POST / HTTP/1.1", &headers, b"hello");
        let parsed = msg.parse().unwrap();
        assert_eq!(parsed.header("content-length"), Some("5"));
        assert_eq!(parsed.body, b"hello");
    }

    #[test]
    fn test_parse_rejects_empty_and_bad_headers() {
        assert!(HttpMessage::request(Vec::new()).parse().is_err());
        assert!(HttpMessage::request(&b"GET / HTTP/1.1\r\nbroken\r\n\r\n"[..]).parse().is_err());
    }

    #[test]
    fn test_service_from_host_header_and_url() {
        let svc = HttpMessage::request(GET).service_from_host_header().unwrap();
        assert_eq!(svc, HttpService::new("example.com", 8443, false));

        let svc = HttpService::from_url("https://example.com/x").unwrap();
        assert_eq!(svc.port, 443);
        assert!(svc.secure);
        assert!(HttpService::from_url("not a url").is_err());
    }

    #[test]
    fn test_context_matches_tool() {
        let ctx = EditorContext::new(ToolSource::Repeater, EditorMode::Default);
        assert!(ctx.matches(&ToolSource::parse("Repeater")));
        assert!(!ctx.matches(&ToolSource::Proxy));
    }
}

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// One HTTP/1.1 request as read off a byte stream. Headers keep their
/// original casing and order; the body is fully materialized (chunked
/// transfer decoded).
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One HTTP/1.1 response. `raw` holds the verbatim bytes as received so the
/// client-side write and the capture see the same exchange; `body` is the
/// decoded payload used for capture.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

impl WireRequest {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

enum BodyFraming {
    Length(usize),
    Chunked,
    None,
    UntilClose,
}

struct Head {
    consumed: usize,
    framing: BodyFraming,
}

fn framing_from_headers(headers: &[(String, String)], close_delimited: bool) -> BodyFraming {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return BodyFraming::Chunked;
        }
    }
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(len) = value.trim().parse::<usize>() {
                return BodyFraming::Length(len);
            }
        }
    }
    if close_delimited {
        BodyFraming::UntilClose
    } else {
        BodyFraming::None
    }
}

/// Read exactly one HTTP/1.1 request from the stream.
pub async fn read_request<S>(stream: &mut S, max_body: usize) -> Result<WireRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut parsed: Option<(WireRequest, Head)> = None;

    loop {
        if parsed.is_none() {
            if let Some(p) = try_parse_request(&buf)? {
                parsed = Some(p);
            } else if buf.len() > MAX_HEAD_BYTES {
                return Err(Error::Decode("request head too large".to_string()));
            }
        }

        if let Some((_, head)) = &parsed {
            if let BodyState::Complete(body) =
                body_complete(&buf[head.consumed..], &head.framing, max_body)?
            {
                let (mut req, _) = parsed.unwrap();
                req.body = body;
                return Ok(req);
            }
        }

        let n = read_some(stream, &mut buf)
            .await
            .map_err(|e| Error::Decode(format!("read request: {e}")))?;
        if n == 0 {
            return Err(Error::Decode("connection closed mid-request".to_string()));
        }
    }
}

/// Read exactly one HTTP/1.1 response bound to an already-written request;
/// `head_request` marks responses that carry no body by definition. An
/// origin that closes mid-body yields the bytes that arrived so far.
pub async fn read_response<S>(
    stream: &mut S,
    max_body: usize,
    head_request: bool,
) -> Result<WireResponse>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut parsed: Option<(WireResponse, Head)> = None;

    loop {
        if parsed.is_none() {
            if let Some(mut p) = try_parse_response(&buf)? {
                if head_request {
                    p.1.framing = BodyFraming::None;
                }
                parsed = Some(p);
            } else if buf.len() > MAX_HEAD_BYTES {
                return Err(Error::Upstream("response head too large".to_string()));
            }
        }

        if let Some((_, head)) = &parsed {
            if let BodyState::Complete(body) =
                body_complete(&buf[head.consumed..], &head.framing, max_body)?
            {
                let (mut resp, _) = parsed.unwrap();
                resp.body = body;
                resp.raw = buf;
                return Ok(resp);
            }
        }

        let n = match read_some(stream, &mut buf).await {
            Ok(n) => n,
            // Mid-body errors degrade to a partial capture.
            Err(_) if parsed.is_some() => 0,
            Err(e) => return Err(Error::Upstream(format!("read response: {e}"))),
        };
        if n == 0 {
            match parsed {
                Some((mut resp, head)) => {
                    resp.body = partial_body(&buf[head.consumed..], &head.framing);
                    resp.raw = buf;
                    return Ok(resp);
                }
                None => return Err(Error::Upstream("connection closed before response".to_string())),
            }
        }
    }
}

async fn read_some<S>(stream: &mut S, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = stream.read(&mut chunk).await?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn try_parse_request(buf: &[u8]) -> Result<Option<(WireRequest, Head)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req.method.unwrap_or("").to_string();
            let target = req.path.unwrap_or("").to_string();
            if method.is_empty() || target.is_empty() {
                return Err(Error::Decode("empty request line".to_string()));
            }
            let headers = collect_headers(req.headers);
            let framing = framing_from_headers(&headers, false);
            Ok(Some((
                WireRequest {
                    method,
                    target,
                    headers,
                    body: Vec::new(),
                },
                Head { consumed, framing },
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::Decode(format!("parse request: {e}"))),
    }
}

fn try_parse_response(buf: &[u8]) -> Result<Option<(WireResponse, Head)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let code = resp.code.unwrap_or(0);
            let reason = resp.reason.unwrap_or("").trim().to_string();
            let headers = collect_headers(resp.headers);
            let framing = if matches!(code, 100..=199 | 204 | 304) {
                BodyFraming::None
            } else {
                framing_from_headers(&headers, true)
            };
            Ok(Some((
                WireResponse {
                    code,
                    reason,
                    headers,
                    body: Vec::new(),
                    raw: Vec::new(),
                },
                Head { consumed, framing },
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::Upstream(format!("parse response: {e}"))),
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

enum BodyState {
    Complete(Vec<u8>),
    Incomplete,
}

fn body_complete(body: &[u8], framing: &BodyFraming, max_body: usize) -> Result<BodyState> {
    if body.len() > max_body {
        return Err(Error::Decode("body exceeds size cap".to_string()));
    }
    match framing {
        BodyFraming::None => Ok(BodyState::Complete(Vec::new())),
        BodyFraming::Length(len) => {
            if body.len() >= *len {
                Ok(BodyState::Complete(body[..*len].to_vec()))
            } else {
                Ok(BodyState::Incomplete)
            }
        }
        BodyFraming::Chunked => match decode_chunked(body) {
            ChunkState::Complete(payload) => Ok(BodyState::Complete(payload)),
            ChunkState::Partial(_) => Ok(BodyState::Incomplete),
        },
        // Close-delimited bodies only finish on EOF.
        BodyFraming::UntilClose => Ok(BodyState::Incomplete),
    }
}

fn partial_body(body: &[u8], framing: &BodyFraming) -> Vec<u8> {
    match framing {
        BodyFraming::None => Vec::new(),
        BodyFraming::Length(len) => body[..body.len().min(*len)].to_vec(),
        BodyFraming::Chunked => match decode_chunked(body) {
            ChunkState::Complete(payload) | ChunkState::Partial(payload) => payload,
        },
        BodyFraming::UntilClose => body.to_vec(),
    }
}

enum ChunkState {
    Complete(Vec<u8>),
    Partial(Vec<u8>),
}

/// Decode a chunked transfer body. Chunk extensions and trailers are
/// tolerated and discarded.
fn decode_chunked(data: &[u8]) -> ChunkState {
    let mut payload = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_end) = find_crlf(&data[pos..]) else {
            return ChunkState::Partial(payload);
        };
        let size_line = &data[pos..pos + line_end];
        let size_str = std::str::from_utf8(size_line)
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return ChunkState::Partial(payload);
        };
        pos += line_end + 2;

        if size == 0 {
            // The message ends with an empty line, optionally preceded by
            // trailer headers. Incomplete terminators stay partial so the
            // raw bytes forwarded to the client are never truncated.
            let rest = &data[pos..];
            if rest.starts_with(b"\r\n") {
                return ChunkState::Complete(payload);
            }
            if rest.windows(4).any(|w| w == b"\r\n\r\n") {
                return ChunkState::Complete(payload);
            }
            return ChunkState::Partial(payload);
        }

        if data.len() < pos + size + 2 {
            let available = data.len().saturating_sub(pos).min(size);
            payload.extend_from_slice(&data[pos..pos + available]);
            return ChunkState::Partial(payload);
        }
        payload.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Serialize a request as HTTP/1.1 wire bytes. A decoded chunked body is
/// re-framed with `Content-Length`; all other headers pass through with
/// multi-values preserved.
pub fn serialize_request(req: &WireRequest) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, req.target).into_bytes();

    let had_length = req.header("content-length").is_some();
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !req.body.is_empty() || had_length {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

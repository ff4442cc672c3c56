//! HTTP/1.x response parsing and body framing.
//!
//! Everything here reads through [`ByteSource`], so it works the same on a
//! live [`Connection`](crate::Connection) and on scripted test input.
use std::collections::BTreeMap;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::http::{Method, StatusCode};

use crate::error::{FramingError, ProtocolError, Result};

/// Longest chunk-size line accepted before the CRLF shows up.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Anything that hands out received bytes in fragments.
#[async_trait(?Send)]
pub trait ByteSource {
    /// The next fragment, `None` once the peer closed.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// The parsed status line and header block of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusAndHeaders {
    /// "1.1" or "1.0"
    pub http_version: String,
    pub status_code: StatusCode,
    pub reason_phrase: String,
    /// Header names are title-cased ("content-length" becomes "Content-Length")
    pub headers: BTreeMap<String, String>,
}

impl StatusAndHeaders {
    /// Looks a header up by any spelling of its name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&title_case(name)).map(String::as_str)
    }
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    NoBody,
    Chunked,
    ContentLength(usize),
    /// Everything until the peer closes
    CloseDelimited,
}

/// Upper-cases the first letter of every alphabetic run, lower-cases the rest.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut word_start = true;
    for c in name.chars() {
        if c.is_ascii_alphabetic() {
            out.push(if word_start { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() });
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// True when a comma-separated header value carries `token`.
pub fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Parses a status line and headers from the start of `buf`.
///
/// Returns `None` while the blank line ending the head has not arrived, or
/// the head plus the number of bytes it took.
pub fn parse_head(buf: &[u8]) -> Result<Option<(StatusAndHeaders, usize)>> {
    let Some(end) = find(buf, b"\r\n\r\n") else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(&buf[..end]);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(FramingError::MalformedHead)?;
    let rest = status_line.strip_prefix("HTTP/").ok_or(FramingError::MalformedHead)?;
    let (http_version, rest) = rest.split_once(' ').ok_or(FramingError::MalformedHead)?;
    let (code, reason_phrase) = rest.split_once(' ').unwrap_or((rest, ""));
    if !matches!(http_version.as_bytes(), [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit()) {
        return Err(FramingError::MalformedHead.into());
    }
    if code.len() != 3 {
        return Err(FramingError::MalformedHead.into());
    }
    let status_code = StatusCode::from_bytes(code.as_bytes()).map_err(|_| FramingError::MalformedHead)?;

    let mut headers = BTreeMap::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(FramingError::MalformedHead)?;
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(FramingError::MalformedHead.into());
        }
        headers.insert(title_case(name), value.trim().to_owned());
    }

    Ok(Some((
        StatusAndHeaders {
            http_version: http_version.to_owned(),
            status_code,
            reason_phrase: reason_phrase.to_owned(),
            headers,
        },
        end + 4,
    )))
}

/// Reads until a complete final response head arrived, skipping any
/// `100 Continue`. Returns the head and the bytes received after it.
pub async fn read_head<S>(source: &mut S, mut buffer: Vec<u8>, max_head_size: usize) -> Result<(StatusAndHeaders, Vec<u8>)>
where
    S: ByteSource + ?Sized,
{
    loop {
        if let Some((head, consumed)) = parse_head(&buffer)? {
            if consumed > max_head_size {
                return Err(FramingError::HeadTooLarge.into());
            }
            let rest = buffer.split_off(consumed);
            if head.status_code == StatusCode::CONTINUE {
                buffer = rest;
                continue;
            }
            return Ok((head, rest));
        }
        if buffer.len() > max_head_size {
            return Err(FramingError::HeadTooLarge.into());
        }
        match source.next_chunk().await? {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => return Err(FramingError::PrematureClose.into()),
        }
    }
}

/// Picks the body framing for a response and whether the connection must be
/// closed afterwards.
///
/// # Errors
/// - `ProtocolError::Informational` for a 1xx head (100 is consumed earlier)
/// - `FramingError::InvalidContentLength` for an unparsable length
pub fn determine_framing(
    head: &StatusAndHeaders,
    method: &Method,
    request_headers: &[(String, String)],
) -> Result<(Framing, bool)> {
    if head.status_code.is_informational() {
        return Err(ProtocolError::Informational(head.status_code.as_u16()).into());
    }

    let request_close = request_headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("connection") && has_token(value, "close"));
    let response_close = head.header("Connection").map_or(false, |value| has_token(value, "close"));
    let mut close = request_close || response_close || head.http_version != "1.1";

    let framing = if *method == Method::HEAD
        || head.status_code == StatusCode::NO_CONTENT
        || head.status_code == StatusCode::NOT_MODIFIED
    {
        Framing::NoBody
    } else if head
        .header("Transfer-Encoding")
        .and_then(|value| value.rsplit(',').next())
        .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
    {
        Framing::Chunked
    } else if let Some(value) = head.header("Content-Length").filter(|v| !v.trim().is_empty()) {
        let length = value
            .trim()
            .parse()
            .map_err(|_| FramingError::InvalidContentLength(value.to_owned()))?;
        Framing::ContentLength(length)
    } else {
        close = true;
        Framing::CloseDelimited
    };
    Ok((framing, close))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    buffer: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
            buffer: Vec::new(),
        }
    }

    /// True after the last chunk and its trailers were consumed.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consumes `data`, appending decoded payload to `out`. Returns whether
    /// the body is complete.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> std::result::Result<bool, FramingError> {
        self.buffer.extend_from_slice(data);
        let mut pos = 0;

        loop {
            let pending = &self.buffer[pos..];
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = find(pending, b"\r\n") else {
                        if pending.len() > MAX_CHUNK_SIZE_LINE {
                            return Err(FramingError::MalformedChunkSize);
                        }
                        break;
                    };
                    let size = parse_chunk_size(&pending[..eol])?;
                    pos += eol + 2;
                    self.state = if size == 0 { ChunkState::Trailers } else { ChunkState::Data(size) };
                }
                ChunkState::Data(remaining) => {
                    if pending.is_empty() {
                        break;
                    }
                    let take = remaining.min(pending.len());
                    out.extend_from_slice(&pending[..take]);
                    pos += take;
                    self.state = if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataEnd => {
                    if pending.len() < 2 {
                        break;
                    }
                    if &pending[..2] != b"\r\n" {
                        return Err(FramingError::MissingChunkTerminator);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(eol) = find(pending, b"\r\n") else {
                        break;
                    };
                    pos += eol + 2;
                    if eol == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => {
                    if !pending.is_empty() {
                        return Err(FramingError::DataAfterLastChunk);
                    }
                    break;
                }
            }
        }

        self.buffer.drain(..pos);
        Ok(self.is_done())
    }
}

/// Hex digits, optionally followed by `;extension`.
fn parse_chunk_size(line: &[u8]) -> std::result::Result<usize, FramingError> {
    let digits = match line.iter().position(|b| *b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(FramingError::MalformedChunkSize);
    }
    let text = std::str::from_utf8(digits).map_err(|_| FramingError::MalformedChunkSize)?;
    usize::from_str_radix(text, 16).map_err(|_| FramingError::MalformedChunkSize)
}

fn exceeds(max: Option<usize>, len: usize) -> bool {
    max.map_or(false, |max| len > max)
}

fn truncated(mut body: Vec<u8>, max: Option<usize>) -> (Bytes, bool) {
    if let Some(max) = max {
        body.truncate(max);
    }
    (Bytes::from(body), true)
}

/// Reads the body according to `framing`, starting with the bytes that
/// arrived together with the head.
///
/// With `max_size`, a longer body is cut to that size without reading the
/// rest; the returned flag is then true and the connection must be closed.
pub async fn read_body<S>(
    source: &mut S,
    framing: Framing,
    rest: Vec<u8>,
    max_size: Option<usize>,
) -> Result<(Bytes, bool)>
where
    S: ByteSource + ?Sized,
{
    match framing {
        Framing::NoBody => {
            if !rest.is_empty() {
                return Err(FramingError::BodyNotEmpty.into());
            }
            Ok((Bytes::new(), false))
        }

        Framing::ContentLength(length) => {
            if rest.len() > length {
                return Err(FramingError::ExcessBytes.into());
            }
            let mut body = rest;
            loop {
                if max_size.map_or(false, |max| length > max && body.len() >= max) {
                    return Ok(truncated(body, max_size));
                }
                if body.len() == length {
                    return Ok((Bytes::from(body), false));
                }
                match source.next_chunk().await? {
                    Some(chunk) => {
                        body.extend_from_slice(&chunk);
                        if body.len() > length {
                            return Err(FramingError::ExcessBytes.into());
                        }
                    }
                    None => return Err(FramingError::PrematureClose.into()),
                }
            }
        }

        Framing::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = Vec::new();
            let mut done = decoder.feed(&rest, &mut body)?;
            loop {
                if exceeds(max_size, body.len()) {
                    return Ok(truncated(body, max_size));
                }
                if done {
                    return Ok((Bytes::from(body), false));
                }
                match source.next_chunk().await? {
                    Some(chunk) => done = decoder.feed(&chunk, &mut body)?,
                    None => return Err(FramingError::PrematureClose.into()),
                }
            }
        }

        Framing::CloseDelimited => {
            let mut body = rest;
            loop {
                if exceeds(max_size, body.len()) {
                    return Ok(truncated(body, max_size));
                }
                match source.next_chunk().await? {
                    Some(chunk) => body.extend_from_slice(&chunk),
                    None => return Ok((Bytes::from(body), false)),
                }
            }
        }
    }
}

//! Byte-range responses synthesized from fully cached content.

use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};

use crate::error::RangeError;

/// A single range from a `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` or `bytes=start-end` (end inclusive).
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-len`: the last `len` bytes.
    Suffix { len: u64 },
}

impl ByteRange {
    pub fn parse(value: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(value.to_string());

        let spec = value.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
        if spec.contains(',') {
            // multipart ranges are not served
            return Err(malformed());
        }
        let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            let len: u64 = end.parse().map_err(|_| malformed())?;
            if len == 0 {
                return Err(malformed());
            }
            return Ok(ByteRange::Suffix { len });
        }

        let start: u64 = start.parse().map_err(|_| malformed())?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().map_err(|_| malformed())?)
        };
        Ok(ByteRange::FromTo { start, end })
    }

    /// Resolve to inclusive `(start, end)` bounds within `length` bytes.
    pub fn resolve(&self, length: u64) -> Result<(u64, u64), RangeError> {
        let (start, end) = match *self {
            ByteRange::FromTo { start, end } => (start, end.unwrap_or(length.saturating_sub(1))),
            ByteRange::Suffix { len } => {
                if length == 0 {
                    return Err(RangeError::NotSatisfiable { start: 0, end: 0, length });
                }
                (length.saturating_sub(len), length - 1)
            }
        };
        if start >= length || end >= length || start > end {
            return Err(RangeError::NotSatisfiable { start, end, length });
        }
        Ok((start, end))
    }
}

/// A slice of cached content answering a range request.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialContent {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub total: u64,
    pub content_type: String,
    pub body: Bytes,
}

impl PartialContent {
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangeOutcome {
    Full { content_type: String, body: Bytes },
    Partial(PartialContent),
}

/// Answer a request against the full cached content.
///
/// No header yields the content unmodified; an unsatisfiable or malformed
/// header is an explicit error, never an empty body.
pub fn respond(content: &Bytes, content_type: &str, range: Option<&str>) -> Result<RangeOutcome, RangeError> {
    let Some(range) = range else {
        return Ok(RangeOutcome::Full {
            content_type: content_type.to_string(),
            body: content.clone(),
        });
    };

    let total = content.len() as u64;
    let (start, end) = ByteRange::parse(range)?.resolve(total)?;
    Ok(RangeOutcome::Partial(PartialContent {
        start,
        end,
        total,
        content_type: content_type.to_string(),
        body: content.slice(start as usize..=end as usize),
    }))
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

impl RangeOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            RangeOutcome::Full { .. } => StatusCode::OK,
            RangeOutcome::Partial(_) => StatusCode::PARTIAL_CONTENT,
        }
    }

    pub fn into_response(self) -> Response<Bytes> {
        let status = self.status();
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let body = match self {
            RangeOutcome::Full { content_type, body } => {
                headers.insert(CONTENT_TYPE, header_value(&content_type));
                body
            }
            RangeOutcome::Partial(partial) => {
                headers.insert(CONTENT_TYPE, header_value(&partial.content_type));
                headers.insert(CONTENT_RANGE, header_value(&partial.content_range()));
                partial.body
            }
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        *response.body_mut() = body;
        response
    }
}

/// The 416 reply for a rejected range.
pub fn not_satisfiable(err: &RangeError) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(err.to_string()));
    *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    if let Some(length) = err.length() {
        response
            .headers_mut()
            .insert(CONTENT_RANGE, header_value(&format!("bytes */{}", length)));
    }
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

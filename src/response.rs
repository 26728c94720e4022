//! Response values shared by the ring buffers and the coalescing groups.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;

/// Status line and headers of a response.
///
/// `HeaderMap` keeps every value of a repeated header and compares names
/// case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }
}

/// A complete, fully buffered response stored in a ring buffer slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

impl CachedResponse {
    /// Build a response whose body is copied out of `body`.
    pub fn new(head: ResponseHead, body: &[u8]) -> Self {
        Self {
            head,
            body: Bytes::copy_from_slice(body),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

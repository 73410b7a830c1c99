//! Parsed request data.

/// Request method as classified by the parser.
///
/// Only GET and HEAD are served; every other syntactically valid token is
/// accepted as `Other` and answered with 501 after the request is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

/// The parts of a request the server actually uses.
///
/// Produced incrementally by the parser; read once it reaches a terminal
/// state, never mutated after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// ASCII HTTP minor-version digit, echoed back in the response.
    /// Stays `b'0'` when parsing fails before the version is seen.
    pub version: u8,
    pub content_length: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Other,
            version: b'0',
            content_length: 0,
        }
    }
}

//! Response assembly.
//!
//! Responses are fixed demo payloads: the interesting part is the status
//! mapping from the parser's terminal state and streaming the bytes out of
//! a chunked buffer under partial writes. The head is assembled in a
//! `BytesMut` and appended to the handler's response buffer; the version
//! digit is echoed from whatever the parser captured.

use crate::http::parser::{ParseError, Parser, Status};
use crate::http::request::Method;
use crate::runtime::buffer::{ChunkBuffer, ChunkPool, OutOfMemory};
use bytes::{BufMut, BytesMut};

const BODY: &[u8] = b"hello world";

/// Status classes this server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    InternalError,
    NotImplemented,
}

impl StatusCode {
    /// Map a parser outcome to a response status.
    ///
    /// DONE with GET/HEAD is served, DONE with any other method is not
    /// implemented, a protocol or read error is the client's fault, and an
    /// allocation failure is ours.
    pub fn for_outcome(status: Status, method: Method) -> StatusCode {
        match status {
            Status::Done => match method {
                Method::Get | Method::Head => StatusCode::Ok,
                Method::Other => StatusCode::NotImplemented,
            },
            Status::Error(ParseError::Memory) => StatusCode::InternalError,
            Status::Error(_) | Status::Wait => StatusCode::BadRequest,
        }
    }

    fn line(self) -> &'static [u8] {
        match self {
            StatusCode::Ok => b" 200 OK\r\n",
            StatusCode::BadRequest => b" 400 Bad Request\r\n",
            StatusCode::InternalError => b" 500 Internal Server Error\r\n",
            StatusCode::NotImplemented => b" 501 Not Implemented\r\n",
        }
    }
}

/// Build the response for a terminal parser into `out`.
///
/// A successful GET gets the demo body; HEAD gets the same Content-Length
/// with no body; everything else is an empty-bodied status. Fails only if
/// the response buffer cannot acquire chunks.
pub fn build(parser: &Parser, out: &mut ChunkBuffer, pool: &mut ChunkPool) -> Result<(), OutOfMemory> {
    let request = parser.request();
    let code = StatusCode::for_outcome(parser.status(), request.method);

    out.append(b"HTTP/1.", pool)?;
    out.append_byte(request.version, pool)?;

    let content_length = if code == StatusCode::Ok { BODY.len() } else { 0 };

    let mut head = BytesMut::with_capacity(64);
    head.put_slice(code.line());
    head.put_slice(b"Content-Length: ");
    head.put_slice(content_length.to_string().as_bytes());
    head.put_slice(b"\r\n\r\n");
    out.append(&head, pool)?;

    if code == StatusCode::Ok && request.method == Method::Get {
        out.append(BODY, pool)?;
    }
    Ok(())
}

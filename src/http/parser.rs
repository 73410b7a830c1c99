//! Incremental HTTP/1.1 request parser.
//!
//! The parser is a resumable state machine driven by a chunked buffer. Every
//! step inspects only bytes already buffered; when a decision needs more
//! bytes than are present the step returns `Wait` without touching `state`
//! or `mark`, so the identical step resumes once more bytes arrive. No byte
//! is ever inspected twice across suspensions, and the result is the same
//! whether a request arrives whole or one byte at a time.
//!
//! `mark` is the consumed-offset into the buffer; head chunks that fall
//! entirely behind it are returned to the pool between steps, which bounds
//! memory for arbitrarily large requests.

use crate::http::request::{Method, Request};
use crate::runtime::buffer::{ChunkBuffer, ChunkPool, OutOfMemory};
use thiserror::Error;

const METHOD_GET: &[u8] = b"GET ";
const METHOD_HEAD: &[u8] = b"HEAD ";
const HTTP_VERSION: &[u8] = b"HTTP/1.";
const CONTENT_LENGTH: &[u8] = b"Content-Length:";
const CRLF: &[u8] = b"\r\n";

/// Position in the request grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    Method,
    /// Generic (non-GET/HEAD) method token scan in progress.
    MethodAny,
    Uri,
    Version,
    /// Between header lines; a bare CRLF here ends the section.
    Headers,
    /// At the start of a header name.
    HeaderName,
    /// Generic header-name scan in progress; the recognized-name match is
    /// not retried from the middle of a name.
    HeaderNameAny,
    HeaderValue,
    HeaderContentLength,
    Body,
    Done,
    Error,
}

/// Why parsing failed; selects the response class for the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Malformed request line, header, or version. Answered with 400.
    #[error("malformed request")]
    Protocol,
    /// Socket read failed (other than would-block). Torn down silently.
    #[error("socket read failed")]
    Read,
    /// Buffer allocation failed. Answered with 500 when possible.
    /// Takes classification priority over a protocol error.
    #[error("buffer allocation failed")]
    Memory,
}

/// Outcome of resuming the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Starved for bytes; resume on the next readability event.
    Wait,
    /// One full request consumed.
    Done,
    Error(ParseError),
}

/// Outcome of a single sub-state step.
enum Step {
    Done,
    Wait,
    Error,
}

/// How far the buffered bytes got against a recognized header name.
enum Prefix {
    Full,
    Partial,
    No,
}

/// One parser per in-flight request, owning the buffer behind it.
pub struct Parser {
    state: ParseState,
    error: Option<ParseError>,
    /// Consumed-offset into `buffer`; bytes before it are fully processed.
    mark: usize,
    /// Body bytes consumed so far.
    body_read: u64,
    buffer: ChunkBuffer,
    request: Request,
}

impl Parser {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            state: ParseState::Start,
            error: None,
            mark: 0,
            body_read: 0,
            buffer: ChunkBuffer::new(chunk_size),
            request: Request::default(),
        }
    }

    /// The parsed request. Meaningful once [`advance`](Self::advance)
    /// returns `Status::Done`.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Consumed-offset into the buffer. Never exceeds
    /// [`buffered`](Self::buffered).
    pub fn mark(&self) -> usize {
        self.mark
    }

    /// Bytes currently held in the backing buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.size()
    }

    /// Current terminal/non-terminal classification without stepping.
    pub fn status(&self) -> Status {
        match self.state {
            ParseState::Done => Status::Done,
            ParseState::Error => Status::Error(self.classify_error()),
            _ => Status::Wait,
        }
    }

    /// Clear all state so the parser can be reused for a new connection.
    pub fn reset(&mut self, pool: &mut ChunkPool) {
        self.buffer.clear(pool);
        self.state = ParseState::Start;
        self.error = None;
        self.mark = 0;
        self.body_read = 0;
        self.request = Request::default();
    }

    /// Append newly received socket bytes to the backing buffer.
    ///
    /// An allocation failure moves the parser to its terminal error state;
    /// it is never silently dropped.
    pub fn feed(&mut self, data: &[u8], pool: &mut ChunkPool) {
        if self.buffer.append(data, pool).is_err() {
            self.error = Some(ParseError::Memory);
            self.state = ParseState::Error;
        }
    }

    /// Record a failed socket read. The connection is presumed broken, so
    /// the handler tears it down without a response.
    pub fn fail_read(&mut self) {
        if !matches!(self.state, ParseState::Done | ParseState::Error) {
            self.error = Some(ParseError::Read);
            self.state = ParseState::Error;
        }
    }

    /// Resume the state machine at its current state.
    ///
    /// Completing one sub-state immediately attempts the next within the
    /// same invocation; the machine never restarts the grammar. Fully
    /// consumed head chunks are reclaimed to the pool after every step.
    pub fn advance(&mut self, pool: &mut ChunkPool) -> Status {
        if self.state == ParseState::Start {
            self.mark = 0;
            self.state = ParseState::Method;
        }

        loop {
            let (step, next) = match self.state {
                ParseState::Method => (self.parse_method(), ParseState::Uri),
                ParseState::MethodAny => (self.parse_method_any(), ParseState::Uri),
                ParseState::Uri => (self.parse_uri(), ParseState::Version),
                ParseState::Version => (self.parse_version(), ParseState::Headers),
                ParseState::Headers
                | ParseState::HeaderName
                | ParseState::HeaderNameAny
                | ParseState::HeaderValue
                | ParseState::HeaderContentLength => {
                    (self.parse_header_section(), ParseState::Body)
                }
                ParseState::Body => (self.parse_body(), ParseState::Done),
                ParseState::Done => return Status::Done,
                ParseState::Error => return Status::Error(self.classify_error()),
                // Rewritten to `Method` before the loop is entered.
                ParseState::Start => unreachable!(),
            };

            self.reclaim(pool);

            match step {
                Step::Done => self.state = next,
                Step::Wait => return Status::Wait,
                Step::Error => {
                    self.state = ParseState::Error;
                    if self.error.is_none() {
                        self.error = Some(ParseError::Protocol);
                    }
                    return Status::Error(self.classify_error());
                }
            }
        }
    }

    fn classify_error(&self) -> ParseError {
        self.error.unwrap_or(ParseError::Protocol)
    }

    /// Unconsumed bytes available to the current step.
    fn ready(&self) -> usize {
        self.buffer.size() - self.mark
    }

    /// Return fully-consumed head chunks to the pool, rebasing `mark`.
    fn reclaim(&mut self, pool: &mut ChunkPool) {
        while self.mark > self.buffer.chunk_size() {
            self.mark -= self.buffer.shift(pool);
        }
    }

    /// Consume `token` at the mark. `Error` means the bytes differ; the
    /// caller decides whether that fails the parse.
    fn parse_literal(&mut self, token: &[u8]) -> Step {
        if self.ready() < token.len() {
            return Step::Wait;
        }
        if !self.buffer.starts_with(self.mark, token) {
            return Step::Error;
        }
        self.mark += token.len();
        Step::Done
    }

    /// Method: "GET " or "HEAD " by literal compare, any other token
    /// scanned generically and classified `Other`.
    fn parse_method(&mut self) -> Step {
        let first = match self.buffer.get(self.mark) {
            Some(b) => b,
            None => return Step::Wait,
        };

        match first {
            b'G' => match self.parse_literal(METHOD_GET) {
                Step::Done => {
                    self.request.method = Method::Get;
                    Step::Done
                }
                other => other,
            },
            b'H' => match self.parse_literal(METHOD_HEAD) {
                Step::Done => {
                    self.request.method = Method::Head;
                    Step::Done
                }
                other => other,
            },
            b if is_token_char(b) => {
                // Commit to the generic scan so a suspension does not
                // re-dispatch on whatever token byte the mark lands on.
                self.state = ParseState::MethodAny;
                self.parse_method_any()
            }
            _ => Step::Error,
        }
    }

    /// Generic method token up to the separating space.
    fn parse_method_any(&mut self) -> Step {
        loop {
            match self.buffer.get(self.mark) {
                Some(b) if is_token_char(b) => {
                    // Keep one byte of lookahead so the terminator check
                    // always has something to inspect.
                    if self.ready() < 2 {
                        return Step::Wait;
                    }
                    self.mark += 1;
                }
                Some(b' ') => {
                    self.mark += 1;
                    self.request.method = Method::Other;
                    return Step::Done;
                }
                Some(_) => return Step::Error,
                None => return Step::Wait,
            }
        }
    }

    /// URI: one or more URI characters, then a space.
    fn parse_uri(&mut self) -> Step {
        if self.ready() < 2 {
            return Step::Wait;
        }
        match self.buffer.get(self.mark) {
            Some(b) if is_uri_char(b) => self.mark += 1,
            _ => return Step::Error,
        }
        loop {
            match self.buffer.get(self.mark) {
                Some(b) if is_uri_char(b) => {
                    if self.ready() < 2 {
                        return Step::Wait;
                    }
                    self.mark += 1;
                }
                Some(b' ') => {
                    self.mark += 1;
                    return Step::Done;
                }
                Some(_) => return Step::Error,
                None => return Step::Wait,
            }
        }
    }

    /// Version: the literal "HTTP/1.", one digit, CRLF. Decided only once
    /// all ten bytes are buffered.
    fn parse_version(&mut self) -> Step {
        if self.ready() < HTTP_VERSION.len() + 3 {
            return Step::Wait;
        }
        match self.parse_literal(HTTP_VERSION) {
            Step::Done => {}
            other => return other,
        }
        match self.buffer.get(self.mark) {
            Some(b) if b.is_ascii_digit() => {
                self.request.version = b;
                self.mark += 1;
            }
            _ => return Step::Error,
        }
        self.parse_literal(CRLF)
    }

    /// Header section: loops over header lines until the bare CRLF.
    fn parse_header_section(&mut self) -> Step {
        loop {
            if self.state == ParseState::Headers {
                match self.parse_literal(CRLF) {
                    // Blank line: the section is complete.
                    Step::Done => return Step::Done,
                    Step::Wait => return Step::Wait,
                    // Not a CRLF, so a header line begins here.
                    Step::Error => self.state = ParseState::HeaderName,
                }
            }

            if matches!(
                self.state,
                ParseState::HeaderName | ParseState::HeaderNameAny
            ) {
                match self.parse_header_name() {
                    Step::Done => {}
                    other => return other,
                }
            }

            let step = match self.state {
                ParseState::HeaderValue => self.parse_header_value(),
                ParseState::HeaderContentLength => self.parse_content_length(),
                _ => Step::Error,
            };
            match step {
                Step::Done => self.state = ParseState::Headers,
                other => return other,
            }
        }
    }

    /// Header name: matched case-insensitively against Content-Length
    /// regardless of method; any other token name is accepted generically.
    fn parse_header_name(&mut self) -> Step {
        if self.state == ParseState::HeaderName {
            match self.match_content_length() {
                Prefix::Full => {
                    self.mark += CONTENT_LENGTH.len();
                    self.state = ParseState::HeaderContentLength;
                    return Step::Done;
                }
                // Could still become Content-Length; wait for more bytes.
                Prefix::Partial => return Step::Wait,
                Prefix::No => self.state = ParseState::HeaderNameAny,
            }
        }

        // Generic name: one or more token characters, then a colon.
        if self.ready() < 2 {
            return Step::Wait;
        }
        match self.buffer.get(self.mark) {
            Some(b) if is_token_char(b) => self.mark += 1,
            _ => return Step::Error,
        }
        loop {
            match self.buffer.get(self.mark) {
                Some(b) if is_token_char(b) => {
                    if self.ready() < 2 {
                        return Step::Wait;
                    }
                    self.mark += 1;
                }
                Some(b':') => {
                    self.mark += 1;
                    self.state = ParseState::HeaderValue;
                    return Step::Done;
                }
                Some(_) => return Step::Error,
                None => return Step::Wait,
            }
        }
    }

    /// Compare the available bytes against "Content-Length:" without
    /// demanding the whole literal be buffered first, so short headers
    /// near the end of a fragment cannot starve the parser.
    fn match_content_length(&self) -> Prefix {
        if self.ready() >= CONTENT_LENGTH.len() {
            return if self.buffer.istarts_with(self.mark, CONTENT_LENGTH) {
                Prefix::Full
            } else {
                Prefix::No
            };
        }
        for (i, &want) in CONTENT_LENGTH.iter().enumerate() {
            match self.buffer.get(self.mark + i) {
                Some(have) if have.eq_ignore_ascii_case(&want) => {}
                Some(_) => return Prefix::No,
                None => return Prefix::Partial,
            }
        }
        Prefix::Full
    }

    /// Generic header value: scanned and discarded; only its length
    /// matters for advancing the mark. Line folding is not supported.
    fn parse_header_value(&mut self) -> Step {
        if self.ready() < 3 {
            return Step::Wait;
        }
        loop {
            match self.buffer.get(self.mark) {
                Some(b) if is_value_char(b) => {
                    self.mark += 1;
                    // Keep the trailing CRLF decidable without waiting.
                    if self.ready() < 3 {
                        return Step::Wait;
                    }
                }
                _ => break,
            }
        }
        self.parse_literal(CRLF)
    }

    /// Content-Length value: looks ahead without consuming, extracts the
    /// decimal string, then consumes it together with the trailing CRLF.
    fn parse_content_length(&mut self) -> Step {
        if self.ready() < 3 {
            return Step::Wait;
        }

        let mut len = 0;
        loop {
            match self.buffer.get(self.mark + len) {
                Some(b) if b.is_ascii_digit() || b == b' ' || b == b'\t' => {
                    len += 1;
                    // Guarantee the byte after the value is inspectable, so
                    // once the scan ends the CRLF is already buffered.
                    if self.ready() < 3 + len {
                        return Step::Wait;
                    }
                }
                _ => break,
            }
        }

        let digits = match self.buffer.copy_out(self.mark, len) {
            Ok(v) => v,
            Err(OutOfMemory) => {
                self.error = Some(ParseError::Memory);
                return Step::Error;
            }
        };
        self.mark += len;

        match self.parse_literal(CRLF) {
            Step::Done => {}
            other => return other,
        }

        // The value must be a plain decimal number; surrounding blanks are
        // tolerated, anything else (including an empty value) is malformed.
        let value = std::str::from_utf8(&digits)
            .ok()
            .map(|s| s.trim_matches(|c| c == ' ' || c == '\t'))
            .and_then(|s| s.parse::<u64>().ok());
        match value {
            Some(n) => {
                self.request.content_length = n;
                Step::Done
            }
            None => Step::Error,
        }
    }

    /// Body: consumes exactly `content_length` bytes; zero is a no-op.
    fn parse_body(&mut self) -> Step {
        if self.request.content_length == 0 {
            return Step::Done;
        }
        let remaining = self.request.content_length - self.body_read;
        let n = (self.ready() as u64).min(remaining);
        if n == 0 {
            return Step::Wait;
        }
        self.body_read += n;
        self.mark += n as usize;
        if self.body_read < self.request.content_length {
            Step::Wait
        } else {
            Step::Done
        }
    }
}

/// HTTP token character (RFC 7230 `tchar`).
fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z')
}

/// URI character (RFC 3986 unreserved, reserved, and '%').
fn is_uri_char(b: u8) -> bool {
    matches!(b,
        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
        | b'-' | b'.' | b'_' | b'~' | b'%'
        | b':' | b'/' | b'?' | b'#' | b'[' | b']' | b'@'
        | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=')
}

/// Header value character: printable, space, or tab.
fn is_value_char(b: u8) -> bool {
    matches!(b, 0x21..=0x7e | b' ' | b'\t')
}

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Range;

use tracing::{debug, error};

use crate::buf::ring::IoRing;
use crate::buf::scan::{
    find_byte, find_crlf, first_not_of, has_token_ignore_case, parse_long, CRLF, LWSP, WSP,
};
use crate::error::ProxyResult;

use super::body::BodyDecoder;

/// RFC 1035 limit on a fully qualified domain name.
pub const MAX_HOST_LEN: usize = 253;

/// Outcome of feeding one received window to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Terminate the session.
    Terminate,
    /// Stay in the current phase; more bytes are needed.
    Continue,
    /// The current phase is complete.
    Proceed,
}

/// Which line handler runs for the next accepted head line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    RequestLine,
    RequestHeader,
    ResponseLine,
    ResponseHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    pub major: u32,
    pub minor: u32,
}

impl HttpVersion {
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Stateful HTTP/1.x head parser and rewriter.
///
/// One instance lives in each session and is reused for the request and then
/// the response of every exchange. `parse_head` consumes the most recent
/// receive window, copies accepted lines into the opposite ring, and at the
/// terminating CRLFCRLF splices the hop headers in before handing the head
/// over. All scanning positions are absolute offsets into the input ring's
/// backing region.
pub struct Parser {
    line: LineKind,
    /// Region still to scan for line breaks.
    scan: Range<usize>,
    /// Scan window parked when a header line ended exactly at the window
    /// edge and might be continued by obs-fold in the next receive.
    saved_scan: Option<Range<usize>>,
    /// End of the last accepted line; 0 until the first line is accepted
    /// (heads always start at the base of a freshly reset ring).
    line_end: usize,
    /// A `Via` line held back for the head-end rewrite.
    via_line: Option<Range<usize>>,
    /// An `X-Forwarded-For` line held back for the head-end rewrite.
    xff_line: Option<Range<usize>>,

    /// Local address of the accepted socket, recorded in `Via`.
    proxy_ip: Ipv4Addr,
    /// Client peer address, recorded in `X-Forwarded-For`.
    client_ip: Ipv4Addr,

    pub version: HttpVersion,
    pub host: String,
    pub port: u16,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub force_close: bool,
    pub keep_alive: bool,
    pub no_transform: bool,
    pub status_code: u16,
    pub reason: String,

    body: BodyDecoder,
}

impl Parser {
    pub fn new(proxy_ip: Ipv4Addr, client_ip: Ipv4Addr) -> Self {
        let mut parser = Self {
            line: LineKind::RequestLine,
            scan: 0..0,
            saved_scan: None,
            line_end: 0,
            via_line: None,
            xff_line: None,
            proxy_ip,
            client_ip,
            version: HttpVersion { major: 1, minor: 0 },
            host: String::new(),
            port: 80,
            content_length: None,
            chunked: false,
            force_close: false,
            keep_alive: false,
            no_transform: false,
            status_code: 0,
            reason: String::new(),
            body: BodyDecoder::new(),
        };
        parser.restart_request();
        parser
    }

    /// Re-arm for the request line of a fresh exchange (keep-alive reuse).
    pub fn restart_request(&mut self) {
        self.line = LineKind::RequestLine;
        self.scan = 0..0;
        self.saved_scan = None;
        self.line_end = 0;
        self.via_line = None;
        self.xff_line = None;
        self.version = HttpVersion { major: 1, minor: 0 };
        self.host.clear();
        self.port = 80;
        self.content_length = None;
        self.chunked = false;
        self.force_close = false;
        self.keep_alive = false;
        self.no_transform = false;
        self.status_code = 0;
        self.reason.clear();
        self.body.reset();
    }

    /// Re-arm for the response of the current exchange. `force_close`
    /// carries over from the request and caps the response's keep-alive.
    pub fn start_response(&mut self) {
        self.line = LineKind::ResponseLine;
        self.scan = 0..0;
        self.saved_scan = None;
        self.line_end = 0;
        self.content_length = None;
        self.chunked = false;
        self.keep_alive = false;
        self.status_code = 0;
        self.reason.clear();
        self.body.reset();
    }

    /// Feed the head parser the window just received into `input`.
    ///
    /// On `Proceed` the head has been copied (rewritten) into `output` and
    /// `input`'s window has been advanced past it; any residual bytes left
    /// in `input` belong to the body.
    pub fn parse_head(
        &mut self,
        input: &mut IoRing,
        output: &mut IoRing,
        recv: Range<usize>,
    ) -> ParseStatus {
        debug_assert!(!recv.is_empty());

        self.scan = match self.saved_scan.take() {
            Some(saved) => saved.start..recv.end,
            // One byte of sticky pre-context so a CRLF split across two
            // receives is still found.
            None => recv.start.saturating_sub(1)..recv.end,
        };

        if self.scan.len() < CRLF.len() {
            return ParseStatus::Continue;
        }

        while let Some(line) = self.next_line(input) {
            let status = match self.line {
                LineKind::RequestLine => self.parse_request_line(input, output, line),
                LineKind::RequestHeader => self.parse_request_header(input, output, line),
                LineKind::ResponseLine => self.parse_response_line(input, output, line),
                LineKind::ResponseHeader => self.parse_response_header(input, output, line),
            };
            if status != ParseStatus::Continue {
                return status;
            }
        }
        ParseStatus::Continue
    }

    /// Decode body framing from the newly received window; payload bytes
    /// stay in their ring.
    pub fn parse_body(&mut self, chunk: &[u8]) -> ParseStatus {
        self.body.feed(chunk)
    }

    /// Find the next complete head line, honouring obs-fold continuations.
    fn next_line(&mut self, input: &IoRing) -> Option<Range<usize>> {
        while !self.scan.is_empty() {
            let hay = input.slice(self.scan.clone());
            let crlf = self.scan.start + find_crlf(hay)?;
            let crlf_end = crlf + CRLF.len();

            if self.line_end != 0 && self.line_end != crlf {
                // A header line (the second condition keeps the CRLFCRLF
                // terminator out of this path). It may continue with
                // leading whitespace on the next line, so a line ending at
                // the window edge cannot be accepted yet.
                if crlf_end == self.scan.end {
                    self.saved_scan = Some(self.scan.clone());
                    return None;
                }
                if WSP.contains(&input.slice(crlf_end..crlf_end + 1)[0]) {
                    self.scan.start = crlf_end + 1;
                    continue;
                }
            }

            let start = if self.line_end == 0 { 0 } else { self.line_end };
            self.line_end = crlf_end;
            self.scan.start = crlf_end;
            return Some(start..crlf_end);
        }
        None
    }

    fn parse_request_line(
        &mut self,
        input: &IoRing,
        output: &mut IoRing,
        line: Range<usize>,
    ) -> ParseStatus {
        let bytes = input.slice(line.clone());
        let end = bytes.len() - CRLF.len();

        let sp1 = match find_byte(bytes, b' ') {
            Some(pos) if pos > 0 => pos,
            _ => {
                debug!("wrong request line: no method");
                return ParseStatus::Terminate;
            }
        };
        let uri_start = sp1 + 1;
        let sp2 = match find_byte(&bytes[uri_start..], b' ') {
            Some(pos) if pos > 0 && uri_start + pos < end => uri_start + pos,
            _ => {
                debug!("wrong request line: no request URI");
                return ParseStatus::Terminate;
            }
        };
        let ver_start = sp2 + 1;
        if ver_start >= end {
            debug!("wrong request line: no HTTP version");
            return ParseStatus::Terminate;
        }
        self.version = match parse_http_version(&bytes[ver_start..end]) {
            Some(version) => version,
            None => {
                debug!("wrong request line: bad HTTP version");
                return ParseStatus::Terminate;
            }
        };
        if !self.version.at_least(1, 1) {
            self.force_close = true;
        }

        self.line = LineKind::RequestHeader;
        self.copy_line(output, bytes)
    }

    fn parse_response_line(
        &mut self,
        input: &IoRing,
        output: &mut IoRing,
        line: Range<usize>,
    ) -> ParseStatus {
        let bytes = input.slice(line.clone());
        let end = bytes.len() - CRLF.len();

        let sp1 = match find_byte(bytes, b' ') {
            Some(pos) if pos > 0 && pos < end => pos,
            _ => {
                debug!("wrong status line: no status code");
                return ParseStatus::Terminate;
            }
        };
        self.version = match parse_http_version(&bytes[..sp1]) {
            Some(version) => version,
            None => {
                debug!("wrong status line: bad HTTP version");
                return ParseStatus::Terminate;
            }
        };

        let rest = &bytes[sp1 + 1..end];
        let (code, reason) = match find_byte(rest, b' ') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &rest[rest.len()..]),
        };
        let parsed = parse_long(code, 10);
        if !parsed.is_ok() || parsed.pos != code.len() || !(100..=999).contains(&parsed.value) {
            debug!("wrong status line: bad status code");
            return ParseStatus::Terminate;
        }
        self.status_code = parsed.value as u16;
        self.reason.clear();
        self.reason.push_str(&String::from_utf8_lossy(reason));

        if self.version.at_least(1, 1) && !self.force_close {
            self.keep_alive = true;
        }

        self.line = LineKind::ResponseHeader;
        self.copy_line(output, bytes)
    }

    fn parse_request_header(
        &mut self,
        input: &mut IoRing,
        output: &mut IoRing,
        line: Range<usize>,
    ) -> ParseStatus {
        if line.len() == CRLF.len() {
            return self.finish_request_head(input, output, line.end);
        }

        let (name, value) = match split_header(input.slice(line.clone())) {
            Some(parts) => parts,
            None => {
                debug!("wrong header line: no colon");
                return ParseStatus::Terminate;
            }
        };

        if name.eq_ignore_ascii_case(b"host") {
            if !self.record_host(value) {
                return ParseStatus::Terminate;
            }
        } else if name.eq_ignore_ascii_case(b"content-length") {
            if !self.record_content_length(value) {
                return ParseStatus::Terminate;
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if has_token_ignore_case(value, b"chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"cache-control") {
            if has_token_ignore_case(value, b"no-transform") {
                self.no_transform = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if has_token_ignore_case(value, b"close") {
                self.force_close = true;
            } else if has_token_ignore_case(value, b"keep-alive") {
                self.force_close = false;
            }
        } else if name.eq_ignore_ascii_case(b"via") {
            if self.via_line.is_none() {
                // withheld; re-emitted with the proxy hop at head end
                self.via_line = Some(line);
                return ParseStatus::Continue;
            }
        } else if name.eq_ignore_ascii_case(b"x-forwarded-for") {
            if self.xff_line.is_none() {
                self.xff_line = Some(line);
                return ParseStatus::Continue;
            }
        }

        let bytes = input.slice(line);
        self.copy_line(output, bytes)
    }

    fn parse_response_header(
        &mut self,
        input: &mut IoRing,
        output: &mut IoRing,
        line: Range<usize>,
    ) -> ParseStatus {
        if line.len() == CRLF.len() {
            return self.finish_response_head(input, output, line.end);
        }

        let (name, value) = match split_header(input.slice(line.clone())) {
            Some(parts) => parts,
            None => {
                debug!("wrong header line: no colon");
                return ParseStatus::Terminate;
            }
        };

        if name.eq_ignore_ascii_case(b"content-length") {
            if !self.record_content_length(value) {
                return ParseStatus::Terminate;
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if has_token_ignore_case(value, b"chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if has_token_ignore_case(value, b"close") {
                self.force_close = true;
            } else if has_token_ignore_case(value, b"keep-alive") {
                self.keep_alive = true;
            }
        }

        let bytes = input.slice(line);
        self.copy_line(output, bytes)
    }

    /// End of the request head: splice the hop headers in before the
    /// terminator, then hand the consumed head region back to the ring.
    fn finish_request_head(
        &mut self,
        input: &mut IoRing,
        output: &mut IoRing,
        head_end: usize,
    ) -> ParseStatus {
        if self.emit_hop_headers(input, output).is_err() || output.append(CRLF).is_err() {
            error!("not enough space in output ring for rewritten head");
            return ParseStatus::Terminate;
        }
        input.consume_to(head_end);
        self.body.start(self.content_length, self.chunked);
        ParseStatus::Proceed
    }

    /// End of the response head: responses are forwarded without rewrite.
    fn finish_response_head(
        &mut self,
        input: &mut IoRing,
        output: &mut IoRing,
        head_end: usize,
    ) -> ParseStatus {
        self.keep_alive = self.keep_alive && !self.force_close;
        if output.append(CRLF).is_err() {
            error!("not enough space in output ring for response head");
            return ParseStatus::Terminate;
        }
        input.consume_to(head_end);
        self.body.start(self.content_length, self.chunked);
        ParseStatus::Proceed
    }

    fn emit_hop_headers(&mut self, input: &IoRing, output: &mut IoRing) -> ProxyResult<()> {
        if self.no_transform {
            // forward any withheld lines untouched
            if let Some(range) = self.via_line.take() {
                output.append(input.slice(range))?;
            }
            if let Some(range) = self.xff_line.take() {
                output.append(input.slice(range))?;
            }
            return Ok(());
        }

        match self.via_line.take() {
            Some(range) => {
                let line = input.slice(range);
                output.append(&line[..line.len() - CRLF.len()])?;
                output.append(format!(", {} {}\r\n", self.version, self.proxy_ip).as_bytes())?;
            }
            None => {
                output.append(format!("Via: {} {}\r\n", self.version, self.proxy_ip).as_bytes())?;
            }
        }
        match self.xff_line.take() {
            Some(range) => {
                let line = input.slice(range);
                output.append(&line[..line.len() - CRLF.len()])?;
                output.append(format!(", {}\r\n", self.client_ip).as_bytes())?;
            }
            None => {
                output.append(format!("X-Forwarded-For: {}\r\n", self.client_ip).as_bytes())?;
            }
        }
        Ok(())
    }

    fn record_host(&mut self, value: &[u8]) -> bool {
        let (name, port) = match find_byte(value, b':') {
            Some(colon) => {
                let parsed = parse_long(&value[colon + 1..], 10);
                if !parsed.is_ok() || !(1..=65535).contains(&parsed.value) {
                    debug!("wrong Host header: bad port");
                    return false;
                }
                (&value[..colon], parsed.value as u16)
            }
            None => (value, 80),
        };
        if name.len() > MAX_HOST_LEN {
            debug!("wrong Host header: name too long");
            return false;
        }
        match std::str::from_utf8(name) {
            Ok(name) => {
                self.host.clear();
                self.host.push_str(name);
                self.port = port;
                true
            }
            Err(_) => {
                debug!("wrong Host header: not valid text");
                false
            }
        }
    }

    fn record_content_length(&mut self, value: &[u8]) -> bool {
        let parsed = parse_long(value, 10);
        if !parsed.is_ok() || parsed.value < 0 {
            debug!("wrong Content-Length header");
            return false;
        }
        self.content_length = Some(parsed.value as u64);
        true
    }

    fn copy_line(&mut self, output: &mut IoRing, bytes: &[u8]) -> ParseStatus {
        if output.append(bytes).is_err() {
            error!("not enough space in output ring");
            return ParseStatus::Terminate;
        }
        ParseStatus::Continue
    }
}

/// Split `Name: value` on the first colon; the value is trimmed of leading
/// whitespace and of the final CRLF, but keeps any obs-fold internals.
fn split_header(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = bytes.len() - CRLF.len();
    let colon = find_byte(&bytes[..end], b':')?;
    let raw = &bytes[colon + 1..end];
    let value = match first_not_of(raw, LWSP) {
        Some(start) => &raw[start..],
        None => &raw[raw.len()..],
    };
    Some((&bytes[..colon], value))
}

fn parse_http_version(bytes: &[u8]) -> Option<HttpVersion> {
    let rest = bytes.strip_prefix(b"HTTP/")?;
    let dot = find_byte(rest, b'.')?;
    let major = parse_long(&rest[..dot], 10);
    let minor = parse_long(&rest[dot + 1..], 10);
    if !major.is_ok() || !minor.is_ok() || major.pos != dot || minor.pos != rest.len() - dot - 1 {
        return None;
    }
    if major.value < 0 || minor.value < 0 {
        return None;
    }
    Some(HttpVersion {
        major: major.value as u32,
        minor: minor.value as u32,
    })
}

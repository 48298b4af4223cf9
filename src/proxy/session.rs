use std::ffi::CStr;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;

use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::buf::ring::{IoRing, RecvStatus, SendStatus, RING_CAPACITY};
use crate::dns::{self, NameCache};
use crate::error::ProxyError;
use crate::http::parser::{ParseStatus, Parser};

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
                             Connection: close\r\n\
                             Content-Type: text/plain\r\n\
                             \r\n";

/// Coarse-grained exchange state; monotonically non-decreasing within one
/// request/response cycle. Keep-alive resets back to `RequestStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    RequestStarted,
    RequestHeadFinished,
    RequestFinished,
    ResponseStarted,
    ResponseHeadFinished,
    ResponseWaitShutdown,
    ResponseFinished,
}

/// Armed readiness interest for one watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn any(&self) -> bool {
        self.read || self.write
    }
}

/// What the driver should do after a callback ran.
#[derive(Debug)]
pub enum Action {
    /// Keep driving with the current streams.
    Continue,
    /// The exchange ended cleanly; tear down and release the pool slot.
    Finish,
    /// Terminate the session because of `ProxyError`.
    Fail(ProxyError),
    /// Drop any current backend connection and connect to `addr`.
    Connect(SocketAddrV4),
    /// Close the backend connection but keep serving the frontend.
    CloseBackend,
}

/// Per-session state: the two rings, the parser, the progress tag and the
/// armed interest of both watchers. Lives in the worker's session pool; the
/// driving task holds the sockets and calls back in whenever one of them is
/// ready.
///
/// Every callback runs to completion without blocking, except for the
/// synchronous resolver call on a name-cache miss.
pub struct SessionCore {
    pub front_buf: IoRing,
    pub back_buf: IoRing,
    pub parser: Parser,
    pub progress: Progress,
    pub front_ev: Interest,
    pub back_ev: Interest,
    /// Target of the live backend connection.
    host: String,
    port: u16,
    ip: Option<Ipv4Addr>,
    /// Set once a keep-alive cycle reuses this session.
    resumed: bool,
    spurious_reads: u32,
    spurious_writes: u32,
}

impl SessionCore {
    pub fn new(proxy_ip: Ipv4Addr, client_ip: Ipv4Addr) -> Self {
        Self {
            front_buf: IoRing::new(RING_CAPACITY),
            back_buf: IoRing::new(RING_CAPACITY),
            parser: Parser::new(proxy_ip, client_ip),
            progress: Progress::RequestStarted,
            front_ev: Interest::read_only(),
            back_ev: Interest::none(),
            host: String::new(),
            port: 0,
            ip: None,
            resumed: false,
            spurious_reads: 0,
            spurious_writes: 0,
        }
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.spurious_reads, self.spurious_writes)
    }

    fn set_progress(&mut self, progress: Progress) {
        self.progress = progress;
        debug!(?progress, "changed progress");
    }

    /// The frontend socket is readable.
    pub fn front_readable(&mut self, front: &TcpStream, cache: &mut NameCache) -> Action {
        let recv = match self.front_buf.recv(front) {
            RecvStatus::BufferFull => {
                self.spurious_reads += 1;
                if self.progress < Progress::RequestHeadFinished {
                    error!("frontend ring full before request head completed");
                    return Action::Fail(ProxyError::BufferFull);
                }
                self.front_ev.read = false;
                return Action::Continue;
            }
            RecvStatus::Shutdown => {
                debug!("client shutdown");
                if self.progress == Progress::RequestStarted && self.front_buf.is_empty() {
                    // the client went away between exchanges
                    return Action::Finish;
                }
                return Action::Fail(ProxyError::PeerShutdown);
            }
            RecvStatus::Error(err) => return Action::Fail(err.into()),
            RecvStatus::WouldBlock => return Action::Continue,
            RecvStatus::Ok(range) => range,
        };

        match self.progress {
            Progress::RequestStarted => {
                match self
                    .parser
                    .parse_head(&mut self.front_buf, &mut self.back_buf, recv)
                {
                    ParseStatus::Proceed => self.request_head_done(cache),
                    ParseStatus::Terminate => {
                        error!("parsing HTTP request failed");
                        Action::Fail(ProxyError::malformed_head("request head"))
                    }
                    ParseStatus::Continue => Action::Continue,
                }
            }
            Progress::RequestHeadFinished => self.feed_request_body(recv),
            _ => {
                // Read interest stays armed on a finished request so a
                // vanishing client is noticed; actual data here is illegal.
                error!("unexpected data on finished request");
                Action::Fail(ProxyError::fatal("data on finished request"))
            }
        }
    }

    /// The request head is complete: pick the target and decide how to get
    /// a backend connection, then account for any body bytes that arrived
    /// with the head.
    fn request_head_done(&mut self, cache: &mut NameCache) -> Action {
        if self.parser.host.is_empty() {
            debug!("no Host header in request");
            return Action::Fail(ProxyError::malformed_head("missing Host header"));
        }
        debug!(
            host = %self.parser.host,
            port = self.parser.port,
            content_length = ?self.parser.content_length,
            chunked = self.parser.chunked,
            force_close = self.parser.force_close,
            "got request"
        );

        let finished = self.parser.content_length == Some(0)
            || (self.parser.content_length.is_none() && !self.parser.chunked);
        self.set_progress(if finished {
            Progress::RequestFinished
        } else {
            Progress::RequestHeadFinished
        });

        let action = if self.resumed {
            // Keep-alive: reconnect only when the target actually changed.
            let mut new_ip = self.ip;
            if self.parser.host != self.host || new_ip.is_none() {
                match dns::resolve(&self.parser.host, cache) {
                    Ok(ip) => new_ip = Some(ip),
                    Err(err) => return Action::Fail(err),
                }
                self.host.clear();
                self.host.push_str(&self.parser.host);
            }
            if self.parser.port != self.port || new_ip != self.ip {
                self.port = self.parser.port;
                self.ip = new_ip;
                self.back_ev = Interest::write_only();
                match new_ip {
                    Some(ip) => Action::Connect(SocketAddrV4::new(ip, self.port)),
                    None => Action::Fail(ProxyError::fatal("reconnect without resolved address")),
                }
            } else {
                self.back_ev = Interest::write_only();
                Action::Continue
            }
        } else {
            self.host.clear();
            self.host.push_str(&self.parser.host);
            self.port = self.parser.port;
            match dns::resolve(&self.host, cache) {
                Ok(ip) => {
                    self.ip = Some(ip);
                    self.back_ev = Interest::write_only();
                    Action::Connect(SocketAddrV4::new(ip, self.port))
                }
                Err(err) => return Action::Fail(err),
            }
        };

        // Body bytes received together with the head are already sitting in
        // the frontend ring; only their framing needs accounting.
        if self.progress == Progress::RequestHeadFinished {
            let residual = self.front_buf.window();
            if !residual.is_empty() {
                let status = self.parser.parse_body(self.front_buf.slice(residual));
                match status {
                    ParseStatus::Proceed => self.set_progress(Progress::RequestFinished),
                    ParseStatus::Terminate => {
                        error!("parsing HTTP request body failed");
                        return Action::Fail(ProxyError::malformed_body("request body"));
                    }
                    ParseStatus::Continue => {}
                }
            }
        }
        action
    }

    fn feed_request_body(&mut self, recv: Range<usize>) -> Action {
        let status = self.parser.parse_body(self.front_buf.slice(recv));
        match status {
            ParseStatus::Proceed => {
                self.set_progress(Progress::RequestFinished);
                self.back_ev.write = true;
                Action::Continue
            }
            ParseStatus::Terminate => {
                error!("parsing HTTP request body failed");
                Action::Fail(ProxyError::malformed_body("request body"))
            }
            ParseStatus::Continue => {
                self.back_ev.write = true;
                Action::Continue
            }
        }
    }

    /// The frontend socket is writable.
    pub fn front_writable(&mut self, front: &TcpStream) -> Action {
        if self.front_buf.is_empty() {
            if self.back_buf.is_empty() {
                if self.progress == Progress::ResponseFinished {
                    debug!("response finished");
                    if self.parser.keep_alive {
                        self.reset_for_keep_alive();
                        return Action::Continue;
                    }
                    return Action::Finish;
                }
                self.spurious_writes += 1;
                self.front_ev.write = false;
                return Action::Continue;
            }
            // take over the backend ring's window wholesale
            self.front_buf.reset();
            self.front_buf.swap(&mut self.back_buf);
            self.back_ev.read = true;
        }

        match self.front_buf.send(front) {
            SendStatus::Error(err) => {
                debug!("client send error: {err}");
                Action::Fail(err.into())
            }
            SendStatus::Ok(_) | SendStatus::WouldBlock => Action::Continue,
        }
    }

    /// The backend socket is readable.
    pub fn back_readable(&mut self, back: &TcpStream) -> Action {
        let recv = match self.back_buf.recv(back) {
            RecvStatus::BufferFull => {
                self.spurious_reads += 1;
                self.back_ev.read = false;
                return Action::Continue;
            }
            RecvStatus::Shutdown => {
                return match self.progress {
                    Progress::ResponseWaitShutdown => {
                        // close-delimited body: upstream FIN ends it
                        self.set_progress(Progress::ResponseFinished);
                        self.back_ev = Interest::none();
                        self.front_ev.write = true;
                        Action::CloseBackend
                    }
                    Progress::RequestStarted if self.resumed => {
                        debug!("backend shutdown while session idle");
                        self.back_ev = Interest::none();
                        self.ip = None;
                        Action::CloseBackend
                    }
                    _ => {
                        debug!("backend shutdown");
                        Action::Fail(ProxyError::PeerShutdown)
                    }
                };
            }
            RecvStatus::Error(err) => return Action::Fail(err.into()),
            RecvStatus::WouldBlock => return Action::Continue,
            RecvStatus::Ok(range) => range,
        };

        if self.progress < Progress::RequestFinished {
            error!("backend data before request completed");
            return Action::Fail(ProxyError::fatal("backend data before request completed"));
        }

        match self.progress {
            Progress::ResponseStarted => {
                match self
                    .parser
                    .parse_head(&mut self.back_buf, &mut self.front_buf, recv)
                {
                    ParseStatus::Proceed => self.response_head_done(),
                    ParseStatus::Terminate => {
                        error!("parsing HTTP response failed");
                        Action::Fail(ProxyError::malformed_head("response head"))
                    }
                    ParseStatus::Continue => Action::Continue,
                }
            }
            Progress::ResponseHeadFinished => self.feed_response_body(recv),
            Progress::ResponseWaitShutdown => {
                // body of unknown length passes through until upstream FIN
                self.front_ev.write = true;
                Action::Continue
            }
            _ => {
                error!("unexpected data on finished response");
                Action::Fail(ProxyError::fatal("data on finished response"))
            }
        }
    }

    fn response_head_done(&mut self) -> Action {
        debug!(
            status = self.parser.status_code,
            reason = %self.parser.reason,
            content_length = ?self.parser.content_length,
            chunked = self.parser.chunked,
            keep_alive = self.parser.keep_alive,
            "got response"
        );

        let next = if self.parser.content_length == Some(0) {
            Progress::ResponseFinished
        } else if self.parser.content_length.is_none() && !self.parser.chunked {
            if self.parser.keep_alive {
                Progress::ResponseFinished
            } else {
                Progress::ResponseWaitShutdown
            }
        } else {
            Progress::ResponseHeadFinished
        };
        self.set_progress(next);
        self.front_ev.write = true;

        if self.progress == Progress::ResponseHeadFinished {
            let residual = self.back_buf.window();
            if !residual.is_empty() {
                let status = self.parser.parse_body(self.back_buf.slice(residual));
                match status {
                    ParseStatus::Proceed => self.set_progress(Progress::ResponseFinished),
                    ParseStatus::Terminate => {
                        error!("parsing HTTP response body failed");
                        return Action::Fail(ProxyError::malformed_body("response body"));
                    }
                    ParseStatus::Continue => {}
                }
            }
        }
        Action::Continue
    }

    fn feed_response_body(&mut self, recv: Range<usize>) -> Action {
        let status = self.parser.parse_body(self.back_buf.slice(recv));
        match status {
            ParseStatus::Proceed => {
                self.set_progress(Progress::ResponseFinished);
                self.front_ev.write = true;
                Action::Continue
            }
            ParseStatus::Terminate => {
                error!("parsing HTTP response body failed");
                Action::Fail(ProxyError::malformed_body("response body"))
            }
            ParseStatus::Continue => {
                self.front_ev.write = true;
                Action::Continue
            }
        }
    }

    /// The backend socket is writable.
    pub fn back_writable(&mut self, back: &TcpStream) -> Action {
        if self.back_buf.is_empty() {
            if self.front_buf.is_empty() {
                if self.progress == Progress::RequestFinished {
                    // request fully delivered; turn around for the response
                    self.back_buf.reset();
                    self.front_buf.reset();
                    self.set_progress(Progress::ResponseStarted);
                    self.back_ev = Interest::read_only();
                    self.parser.start_response();
                    return Action::Continue;
                }
                self.spurious_writes += 1;
                self.back_ev.write = false;
                return Action::Continue;
            }
            self.back_buf.reset();
            self.back_buf.swap(&mut self.front_buf);
            self.front_ev.read = true;
        }

        match self.back_buf.send(back) {
            SendStatus::Error(err) => {
                debug!("backend send error: {err}");
                Action::Fail(err.into())
            }
            SendStatus::Ok(_) | SendStatus::WouldBlock => Action::Continue,
        }
    }

    /// The backend connect attempt failed.
    pub fn connect_failed(&mut self, err: io::Error) -> Action {
        debug!("backend connect failed: {err}");
        if self.progress != Progress::RequestFinished {
            // the request body is still in flight; the rings are not free
            // to carry a synthesised answer
            return Action::Fail(ProxyError::UpstreamConnectFailed { source: err });
        }

        self.set_progress(Progress::ResponseFinished);
        self.back_buf.reset();
        self.back_ev = Interest::none();

        self.front_buf.reset();
        if self.front_buf.append(BAD_GATEWAY).is_err()
            || self
                .front_buf
                .append(os_error_text(&err).as_bytes())
                .is_err()
        {
            return Action::Fail(ProxyError::BufferFull);
        }
        self.front_ev = Interest::write_only();
        Action::Continue
    }

    fn reset_for_keep_alive(&mut self) {
        self.parser.restart_request();
        self.front_buf.reset();
        self.back_buf.reset();
        self.set_progress(Progress::RequestStarted);
        self.front_ev = Interest::read_only();
        // keep watching the idle backend so its FIN is noticed
        self.back_ev = Interest::read_only();
        self.resumed = true;
    }
}

/// `strerror`-style message with the raw errno, e.g. `Connection refused (111)`.
fn os_error_text(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => {
            let msg = unsafe { CStr::from_ptr(libc::strerror(code)) };
            format!("{} ({})", msg.to_string_lossy(), code)
        }
        None => err.to_string(),
    }
}

//! # Requests
//!
//! A [`Request`] carries one RPC: method name, parameters, return values and an
//! error `(code, message)` pair. The same type is used on both sides. Callers
//! build one and hand it to a [`Target`](crate::protocol::target::Target); the
//! server builds one per inbound Request packet and hands it to the method
//! handler, which fills in return values or an error.
//!
//! A handler that cannot answer right away calls [`Request::detach`] and
//! answers later, from any thread, through the returned [`DetachedRequest`].

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::core::packet::{Packet, FLAG_NOREPLY, FLAG_REVERSE};
use crate::core::value::Values;
use crate::crypto::AuthContext;
use crate::transport::ConnectionShared;

/// RPC error codes carried in Error packets.
///
/// Codes below 0x10000 are reserved for the transport; applications pick
/// their own codes above that.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCode;

impl ErrorCode {
    pub const NONE: u32 = 0;
    pub const GENERAL_ERROR: u32 = 100;
    pub const NOT_IMPLEMENTED: u32 = 101;
    pub const ABORT: u32 = 102;
    pub const TIMEOUT: u32 = 103;
    pub const CONNECTION: u32 = 104;
    pub const BAD_REQUEST: u32 = 105;
    pub const NO_SUCH_METHOD: u32 = 106;
    pub const WRONG_PARAMS: u32 = 107;
    pub const OVERLOAD: u32 = 108;
    pub const WRONG_RETURN: u32 = 109;
    pub const BAD_REPLY: u32 = 110;
    pub const METHOD_FAILED: u32 = 111;
    pub const PERMISSION_DENIED: u32 = 112;

    /// First code available to applications.
    pub const APPLICATION_BASE: u32 = 0x10000;

    /// Default text for `code`.
    pub fn message(code: u32) -> &'static str {
        match code {
            Self::NONE => "No error",
            Self::GENERAL_ERROR => "(RPC) General error",
            Self::NOT_IMPLEMENTED => "(RPC) Not implemented",
            Self::ABORT => "(RPC) Invocation aborted",
            Self::TIMEOUT => "(RPC) Invocation timed out",
            Self::CONNECTION => "(RPC) Connection error",
            Self::BAD_REQUEST => "(RPC) Bad request packet",
            Self::NO_SUCH_METHOD => "(RPC) No such method",
            Self::WRONG_PARAMS => "(RPC) Illegal parameters",
            Self::OVERLOAD => "(RPC) Request dropped due to server overload",
            Self::WRONG_RETURN => "(RPC) Illegal return values",
            Self::BAD_REPLY => "(RPC) Bad reply packet",
            Self::METHOD_FAILED => "(RPC) Method failed",
            Self::PERMISSION_DENIED => "(RPC) Permission denied",
            code if code < Self::APPLICATION_BASE => "(RPC) Unknown error",
            _ => "Unknown error",
        }
    }
}

/// Where a server-side request came from and how to answer it.
struct ReplyRoute {
    conn: Arc<ConnectionShared>,
    request_id: u32,
    flags: u16,
}

/// One remote procedure call.
#[derive(Default)]
pub struct Request {
    method: String,
    params: Values,
    returns: Values,
    error_code: u32,
    error_message: String,
    noreply: bool,
    return_types: Option<String>,
    detached: bool,
    route: Option<ReplyRoute>,
}

impl Request {
    /// New outbound request for `method` with no parameters yet.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Server side: a request decoded from a Request packet on `conn`.
    pub(crate) fn inbound(
        conn: Arc<ConnectionShared>,
        request_id: u32,
        flags: u16,
        method: String,
        params: Values,
    ) -> Self {
        Self {
            method,
            params,
            noreply: flags & FLAG_NOREPLY != 0,
            route: Some(ReplyRoute {
                conn,
                request_id,
                flags,
            }),
            ..Self::default()
        }
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Values {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Values {
        &mut self.params
    }

    pub fn returns(&self) -> &Values {
        &self.returns
    }

    pub fn returns_mut(&mut self) -> &mut Values {
        &mut self.returns
    }

    pub(crate) fn set_returns(&mut self, returns: Values) {
        self.returns = returns;
    }

    /// Fail the request with `code` and an explicit message.
    pub fn set_error(&mut self, code: u32, message: impl Into<String>) {
        self.error_code = code;
        self.error_message = message.into();
    }

    /// Fail the request with `code` and its default message.
    pub fn set_error_code(&mut self, code: u32) {
        self.set_error(code, ErrorCode::message(code));
    }

    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn is_error(&self) -> bool {
        self.error_code != ErrorCode::NONE
    }

    /// Whether the caller wants no answer.
    pub fn is_noreply(&self) -> bool {
        self.noreply
    }

    pub(crate) fn set_noreply(&mut self, noreply: bool) {
        self.noreply = noreply;
    }

    /// Whether [`Request::detach`] took this request over.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Identity of the calling peer, for server-side requests.
    pub fn auth_context(&self) -> AuthContext {
        self.route
            .as_ref()
            .map(|route| route.conn.auth_context())
            .unwrap_or_default()
    }

    /// Connection a server-side request arrived on.
    pub fn connection(&self) -> Option<&Arc<ConnectionShared>> {
        self.route.as_ref().map(|route| &route.conn)
    }

    pub(crate) fn set_return_types(&mut self, types: &str) {
        self.return_types = Some(types.to_string());
    }

    /// Take the request over so it can be answered later, from any thread.
    ///
    /// The request left behind is empty and marked detached; the dispatcher
    /// sends nothing for it.
    pub fn detach(&mut self) -> DetachedRequest {
        let request = std::mem::take(self);
        self.detached = true;
        DetachedRequest {
            request,
            answered: false,
        }
    }

    /// Clear results and error so the request can be sent again.
    pub fn reset(&mut self) {
        self.returns.clear();
        self.error_code = ErrorCode::NONE;
        self.error_message.clear();
    }

    /// Send the answer back to the caller, unless it asked for none.
    pub(crate) fn send_reply(mut self) {
        let Some(route) = self.route.take() else {
            return;
        };
        if self.noreply {
            trace!(method = %self.method, "Dropping answer to noreply request");
            return;
        }
        if !self.is_error() {
            if let Some(types) = self.return_types.as_deref() {
                if !self.returns.satisfies(types) {
                    warn!(
                        method = %self.method,
                        expected = types,
                        actual = %self.returns.type_string(),
                        "Handler returned wrong types"
                    );
                    self.set_error_code(ErrorCode::WRONG_RETURN);
                }
            }
        }
        let flags = route.flags & FLAG_REVERSE;
        let packet = if self.is_error() {
            Packet::error(route.request_id, self.error_code, self.error_message)
        } else {
            Packet::reply(route.request_id, self.returns)
        };
        if !route.conn.post_packet(packet.with_flags(flags), None) {
            trace!(request_id = route.request_id, "Connection gone before reply");
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("error_code", &self.error_code)
            .field("error_message", &self.error_message)
            .field("noreply", &self.noreply)
            .field("detached", &self.detached)
            .finish()
    }
}

/// A server-side request answered outside its handler.
///
/// Call [`DetachedRequest::done`] exactly once. Dropping it unanswered replies
/// with [`ErrorCode::METHOD_FAILED`] so the caller is not left waiting.
pub struct DetachedRequest {
    request: Request,
    answered: bool,
}

impl DetachedRequest {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn params(&self) -> &Values {
        self.request.params()
    }

    pub fn returns_mut(&mut self) -> &mut Values {
        self.request.returns_mut()
    }

    pub fn set_error(&mut self, code: u32, message: impl Into<String>) {
        self.request.set_error(code, message);
    }

    /// Send the answer.
    pub fn done(mut self) {
        self.answered = true;
        std::mem::take(&mut self.request).send_reply();
    }
}

impl Drop for DetachedRequest {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        let mut request = std::mem::take(&mut self.request);
        warn!(method = %request.method, "Detached request dropped without an answer");
        if !request.is_error() {
            request.set_error(
                ErrorCode::METHOD_FAILED,
                "Detached request dropped without an answer",
            );
        }
        request.send_reply();
    }
}

//! Server transports
//!
//! Each transport turns its physical connections into calls on the
//! [`crate::ProtocolManager`]:
//! - [`ws`]: full-duplex WebSocket, one transport id per accepted socket
//! - [`http`]: HTTP POST per message with long-poll `poll` for server push
//! - [`broker`]: request/reply over a message broker, the reply queue is the transport id

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

pub mod broker;
pub mod http;
pub mod ws;

pub type ResponseBody = Full<Bytes>;

pub(crate) fn json_response(body: String) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn status_response(status: StatusCode, message: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

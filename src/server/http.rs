//! HTTP response building
//!
//! Requests are parsed and responses framed by hyper; this module only
//! shapes the few responses the server sends.

use std::convert::Infallible;
use std::io;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::broadcast::Boundary;

/// Maximum size of a request head
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Body type of every response
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

fn infallible(never: Infallible) -> io::Error {
    match never {}
}

/// A body sent in one piece with a known length
pub fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(infallible).boxed_unsync()
}

/// A body read from `reader` until it reaches EOF
pub fn reader_body<R>(reader: R) -> ResponseBody
where
    R: AsyncRead + Send + 'static,
{
    StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
}

fn with_common_headers(mut response: Response<ResponseBody>) -> Response<ResponseBody> {
    let headers = response.headers_mut();
    headers
        .entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// A complete response with `Connection: close`
pub fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    with_common_headers(response)
}

/// `204 No Content`
pub fn no_content() -> Response<ResponseBody> {
    let mut response = Response::new(Empty::new().map_err(infallible).boxed_unsync());
    *response.status_mut() = StatusCode::NO_CONTENT;
    with_common_headers(response)
}

/// `405 Method Not Allowed`
pub fn method_not_allowed() -> Response<ResponseBody> {
    let mut response = response(StatusCode::METHOD_NOT_ALLOWED, "text/plain", Bytes::new());
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
    response
}

/// The response opening an MJPEG stream; `body` carries the parts
pub fn stream_response(boundary: &Boundary, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(content_type) = HeaderValue::from_str(&boundary.content_type()) {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    with_common_headers(response)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn body_bytes(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_response() {
        let response = response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "busy");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "close");
        assert_eq!(body_bytes(response).await, "busy");
    }

    #[tokio::test]
    async fn test_no_content_has_empty_body() {
        let response = no_content();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        assert!(body_bytes(response).await.is_empty());
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = method_not_allowed();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD");
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let response = stream_response(&Boundary::new("b"), full(Bytes::new()));

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=b"
        );
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::CONNECTION], "close");
    }

    #[tokio::test]
    async fn test_reader_body_ends_with_writer() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let body = reader_body(reader);

        let feed = tokio::spawn(async move {
            for chunk in [&b"--b\r\n"[..], b"part one", b"part two"] {
                writer.write_all(chunk).await.unwrap();
            }
            // Dropping the writer ends the body
        });

        let collected = body.collect().await.unwrap().to_bytes();
        feed.await.unwrap();
        assert_eq!(collected, &b"--b\r\npart onepart two"[..]);
    }
}

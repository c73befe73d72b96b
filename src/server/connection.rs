//! Per-connection request handling
//!
//! Each accepted socket is served by hyper and carries exactly one request.
//! Stream requests are admitted through the client registry; a pump task
//! then feeds the broadcaster's multipart output into the response body
//! until the client leaves, is evicted, or the server stops.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::ServerConfig;
use super::http::{self, ResponseBody, MAX_HEAD_LEN};
use crate::broadcast::{multipart, StreamBroadcaster, StreamEnd};
use crate::error::{Error, Result};
use crate::event::{ActionRequest, EventBus, ServerEvent};
use crate::registry::{ClientHandle, ClientRegistry};

/// Bytes buffered between the broadcaster and hyper for one stream
const STREAM_PIPE_CAPACITY: usize = 64 * 1024;

/// State shared by every connection of one running server
pub(crate) struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ClientRegistry>,
    pub broadcaster: Arc<StreamBroadcaster>,
    pub events: EventBus,
    pub blocked_image: Bytes,
    /// Cancelled when the server starts stopping
    pub shutdown: CancellationToken,
    /// Cancelled when stop gives up waiting for in-flight writes
    pub abandon: CancellationToken,
    pub tracker: TaskTracker,
}

/// What a request resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Stream,
    Index,
    StartStop,
    NotFound,
}

impl Route {
    fn resolve(config: &ServerConfig, path: &str) -> Self {
        if path == config.stream_path {
            Route::Stream
        } else if config.start_stop_path.as_deref() == Some(path) {
            Route::StartStop
        } else if path == config.index_path && config.index_html.is_some() {
            Route::Index
        } else {
            Route::NotFound
        }
    }
}

/// A single client connection
pub(crate) struct Connection {
    peer_addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
    /// Set once the request turned into a live stream
    streaming: AtomicBool,
    /// Cancelled by the stream pump when the peer must be cut off
    hangup: CancellationToken,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr, ctx: Arc<ConnectionContext>) -> Arc<Self> {
        Arc::new(Self {
            peer_addr,
            ctx,
            streaming: AtomicBool::new(false),
            hangup: CancellationToken::new(),
        })
    }

    /// Serve one request on `stream`
    ///
    /// Anything but a live stream must be read and answered within
    /// `request_timeout + write_timeout`. Every connection is dropped on
    /// abandon.
    pub async fn run<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = {
            let conn = Arc::clone(&self);
            service_fn(move |request| {
                let conn = Arc::clone(&conn);
                async move { Ok::<_, Infallible>(conn.handle(request).await) }
            })
        };

        let config = &self.ctx.config;
        let serving = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(config.request_timeout)
            .keep_alive(false)
            .max_buf_size(MAX_HEAD_LEN)
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(serving);

        let deadline = tokio::time::sleep(config.request_timeout + config.write_timeout);
        tokio::pin!(deadline);
        let mut deadline_armed = true;
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.abandon.cancelled() => {
                    tracing::debug!(peer = %self.peer_addr, "Connection abandoned");
                    return Ok(());
                }
                _ = self.hangup.cancelled() => return Ok(()),
                _ = self.ctx.shutdown.cancelled(), if !draining => {
                    draining = true;
                    serving.as_mut().graceful_shutdown();
                }
                _ = &mut deadline, if deadline_armed => {
                    deadline_armed = false;
                    if !self.is_streaming() {
                        return Err(Error::Timeout);
                    }
                }
                result = serving.as_mut() => return result.map_err(Error::from),
            }
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody> {
        let ctx = &self.ctx;
        let method = request.method();
        let path = request.uri().path();

        tracing::debug!(peer = %self.peer_addr, method = %method, path = %path, "Request");

        let with_body = if *method == Method::GET {
            true
        } else if *method == Method::HEAD {
            false
        } else {
            return http::method_not_allowed();
        };

        match Route::resolve(&ctx.config, path) {
            Route::Stream if with_body => self.serve_stream().await,
            Route::Stream => http::method_not_allowed(),
            Route::StartStop => {
                ctx.events.send(ServerEvent::Action(ActionRequest::StartStop));
                http::no_content()
            }
            Route::Index => {
                let html = ctx.config.index_html.clone().unwrap_or_default();
                http::response(StatusCode::OK, "text/html; charset=utf-8", html)
            }
            Route::NotFound => http::response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        }
    }

    async fn serve_stream(&self) -> Response<ResponseBody> {
        let ctx = &self.ctx;
        let boundary = ctx.broadcaster.boundary();

        if ctx.config.blocked_addresses.contains(&self.peer_addr.ip()) {
            tracing::info!(peer = %self.peer_addr, "Blocked address, sending blocked image");
            let part = multipart::encode_part(boundary, &ctx.blocked_image);
            return http::stream_response(boundary, http::full(part));
        }

        let client = match ctx.registry.admit(self.peer_addr).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(peer = %self.peer_addr, error = %e, "Stream refused");
                return http::response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "text/plain",
                    "Too many clients",
                );
            }
        };

        self.streaming.store(true, Ordering::Release);
        client.mark_streaming().await;

        let (writer, reader) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
        ctx.tracker.spawn(pump(
            Arc::clone(ctx),
            client,
            writer,
            self.hangup.clone(),
        ));

        http::stream_response(boundary, http::reader_body(reader))
    }
}

/// Write the multipart stream for one client into the response pipe
///
/// The pipe fills up when hyper cannot hand bytes to the peer, so a slow
/// peer stalls `stream_to` exactly like a slow socket would.
async fn pump(
    ctx: Arc<ConnectionContext>,
    client: ClientHandle,
    mut writer: DuplexStream,
    hangup: CancellationToken,
) {
    let result = ctx
        .broadcaster
        .stream_to(&client, &mut writer, ctx.config.write_policy(), &ctx.abandon)
        .await;

    match result {
        // Dropping the writer ends the body and hyper closes the response
        Ok(end @ (StreamEnd::Unregistered | StreamEnd::SourceClosed)) => {
            tracing::debug!(client = %client.id(), end = ?end, "Stream ended");
        }
        Ok(end) => {
            tracing::debug!(client = %client.id(), end = ?end, "Stream ended");
            hangup.cancel();
        }
        Err(e) => {
            tracing::debug!(client = %client.id(), error = %e, "Stream failed");
            hangup.cancel();
        }
    }

    client.disconnect().await;
}

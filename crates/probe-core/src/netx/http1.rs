//! HTTP/1.1 client bound to one connection
//!
//! The protocol work is done by a `hyper` client connection. Its I/O goes
//! through [`SlotIo`], which polls the connection in place inside its
//! [`TrackedConn`] slot: whoever closes the slot also stops the transfer.

use super::{BoxConn, Context, HttpRequest, HttpResponse, HttpTransport, TrackedConn};
use crate::failure::{NetError, Operation, CONNECTION_ALREADY_CLOSED};
use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::client::conn::{Builder, SendRequest};
use hyper::Body;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tracing::debug;

fn already_closed() -> io::Error {
    NetError::new(Operation::HttpRoundTrip, CONNECTION_ALREADY_CLOSED).into_io()
}

/// I/O over the connection held by a [`TrackedConn`]
struct SlotIo {
    conn: TrackedConn<BoxConn>,
}

impl AsyncRead for SlotIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.conn
            .with_mut(|conn| Pin::new(conn).poll_read(cx, buf))
            .unwrap_or_else(|| Poll::Ready(Err(already_closed())))
    }
}

impl AsyncWrite for SlotIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.conn
            .with_mut(|conn| Pin::new(conn).poll_write(cx, buf))
            .unwrap_or_else(|| Poll::Ready(Err(already_closed())))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.conn
            .with_mut(|conn| Pin::new(conn).poll_flush(cx))
            .unwrap_or_else(|| Poll::Ready(Err(already_closed())))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.conn
            .with_mut(|conn| Pin::new(conn).poll_shutdown(cx))
            .unwrap_or(Poll::Ready(Ok(())))
    }
}

/// HTTP/1.1 transport sending every request over the same connection.
///
/// The connection stays in its [`TrackedConn`] slot between requests so
/// the pool that tracks it can close it at any time. When the server hangs
/// up, or a response leaves the connection unusable, the slot is closed
/// and later requests fail with `connection_already_closed`.
#[derive(Clone)]
pub struct Http1Transport {
    conn: TrackedConn<BoxConn>,
    network: &'static str,
    sender: Arc<Mutex<Option<SendRequest<Body>>>>,
}

impl std::fmt::Debug for Http1Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Transport")
            .field("conn", &self.conn)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Http1Transport {
    /// Transport over `conn`
    pub fn new(conn: TrackedConn<BoxConn>) -> Self {
        let network = conn.with(|c| c.network()).unwrap_or("tcp");
        Self {
            conn,
            network,
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the client connection and the task driving it
    async fn handshake(&self) -> io::Result<SendRequest<Body>> {
        let io = SlotIo {
            conn: self.conn.clone(),
        };
        let (sender, connection) = Builder::new()
            .http1_title_case_headers(true)
            .handshake::<_, Body>(io)
            .await
            .map_err(hyper_to_io)?;

        let conn = self.conn.clone();
        let closed = conn.close_token();
        tokio::spawn(async move {
            tokio::select! {
                res = connection => {
                    if let Err(err) = res {
                        debug!("HTTP connection ended: {err}");
                    }
                    conn.close();
                }
                () = closed.cancelled() => {}
            }
        });
        Ok(sender)
    }

    async fn exchange(&self, req: &HttpRequest, max_body: usize) -> io::Result<HttpResponse> {
        let mut slot = self.sender.lock().await;
        if !self.conn.is_present() {
            return Err(already_closed());
        }
        if slot.is_none() {
            *slot = Some(self.handshake().await?);
        }
        let sender = slot.as_mut().ok_or_else(already_closed)?;

        std::future::poll_fn(|cx| sender.poll_ready(cx))
            .await
            .map_err(hyper_to_io)?;
        debug!("HTTP {} {}", req.method, req.url);
        let resp = sender
            .send_request(build_request(req)?)
            .await
            .map_err(hyper_to_io)?;
        read_response(resp, max_body).await
    }
}

#[async_trait]
impl HttpTransport for Http1Transport {
    async fn round_trip(
        &self,
        ctx: &Context,
        req: &HttpRequest,
        max_body: usize,
    ) -> io::Result<HttpResponse> {
        ctx.guard(self.exchange(req, max_body)).await
    }

    fn network(&self) -> &str {
        self.network
    }
}

/// Map a `hyper` error onto the I/O error that caused it, keeping the
/// original error when there is one so it classifies as such.
fn hyper_to_io(err: hyper::Error) -> io::Error {
    if err.is_parse() {
        return io::Error::new(io::ErrorKind::InvalidData, format!("malformed HTTP response: {err}"));
    }
    if err.is_closed() || err.is_canceled() {
        return already_closed();
    }
    let incomplete = err.is_incomplete_message();
    let message = err.to_string();
    match err.into_cause().map(|cause| cause.downcast::<io::Error>()) {
        Some(Ok(cause)) => *cause,
        _ if incomplete => io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected EOF"),
        _ => io::Error::new(io::ErrorKind::Other, message),
    }
}

/// The `hyper` request for `req`. `Host` comes from the URL unless set.
pub fn build_request(req: &HttpRequest) -> io::Result<hyper::Request<Body>> {
    let target = &req.url[url::Position::BeforePath..url::Position::AfterQuery];
    let target = if target.is_empty() { "/" } else { target };

    let mut builder = hyper::Request::builder().method(req.method.as_str()).uri(target);
    if req.header("Host").is_none() {
        builder = builder.header("Host", super::url_host(&req.url));
    }
    for (name, value) in &req.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::empty())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid HTTP request: {e}")))
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Status, headers and at most `max_body` bytes of body.
///
/// Dropping the rest of a longer body lets `hyper` drain it or close the
/// connection, so the next response never starts mid-body.
async fn read_response(resp: hyper::Response<Body>, max_body: usize) -> io::Result<HttpResponse> {
    let (parts, mut body) = resp.into_parts();
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let mut data = Vec::new();
    while data.len() < max_body {
        let Some(chunk) = body.data().await else {
            break;
        };
        let chunk = chunk.map_err(hyper_to_io)?;
        let room = max_body - data.len();
        data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    Ok(HttpResponse {
        status_code: parts.status.as_u16(),
        headers,
        body: data,
    })
}

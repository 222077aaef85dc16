//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and drives one [`Connection`] state machine per socket in
//! its own task. Requests on a connection are answered strictly in the order they
//! arrive: bytes for a pipelined request are read and buffered while the previous
//! handler runs, but nothing after the current request is decoded until its
//! response has been written.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Limits;
use crate::connection::{Connection, Disposition, ProtocolViolation};
use crate::context::Context;
use crate::database::{LeaseBroker, Pool};
use crate::http::{DecodeError, Event, Request, RequestDecoder, Response, ResponseWriter};
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single connection ended abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The request could not be decoded; an error response was already sent.
    #[error("request rejected: {0}")]
    Rejected(#[source] DecodeError),
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// What the server serves: the route table and, optionally, a pool to lease from.
pub struct App {
    router: Router,
    broker: Option<LeaseBroker>,
}

impl App {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            broker: None,
        }
    }

    /// Makes `pool` available to leased handlers.
    #[must_use]
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.broker = Some(LeaseBroker::new(pool));
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn broker(&self) -> Option<&LeaseBroker> {
        self.broker.as_ref()
    }

    /// Runs the handler for one request.
    pub async fn call(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        self.router
            .dispatch(Context::new(request, self.broker.clone(), peer))
            .await
    }
}

/// The rivet HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use rivet::router::Router;
/// use rivet::server::{App, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:3000").await?;
///     server
///         .run_until(App::new(Router::new()), async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limits: Limits,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            limits: Limits::default(),
        })
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the process is terminated.
    pub async fn run(self, app: App) -> Result<(), ServerError> {
        self.run_until(app, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running in their own tasks; only the accept
    /// loop stops.
    pub async fn run_until(
        self,
        app: App,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let app = Arc::new(app);
        info!(address = %self.local_addr, "rivet listening");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "no longer accepting connections");
                    return Ok(());
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);
            let limits = self.limits;

            tokio::spawn(async move {
                match serve_connection(stream, peer_addr, app, limits).await {
                    Ok(()) => debug!(peer = %peer_addr, "connection closed"),
                    Err(ConnectionError::Protocol(e)) => {
                        error!(peer = %peer_addr, error = %e, "protocol violation")
                    }
                    Err(ConnectionError::Rejected(_)) => {
                        debug!(peer = %peer_addr, "connection closed after rejection")
                    }
                    Err(e) => warn!(peer = %peer_addr, error = %e, "connection closed with error"),
                }
            });
        }
    }
}

/// Serves one connection until either side closes it.
///
/// Generic over the transport so it can be driven by an in-memory duplex in tests.
pub async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    app: Arc<App>,
    limits: Limits,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = RequestDecoder::new(limits.max_head_bytes, limits.max_body_bytes);
    let mut conn = Connection::new();
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    // Read-ahead while a handler runs stops here; TCP flow control does the rest.
    let read_ahead_limit = limits.max_head_bytes.saturating_add(limits.max_body_bytes);

    loop {
        // Everything already buffered is handled before the socket is read again.
        while let Some(event) =
            next_event(&mut decoder, &mut buf, &mut conn, &mut stream, peer).await?
        {
            match event {
                Event::Head(head) => conn.receive_head(head)?,
                Event::Body(chunk) => conn.receive_body(&chunk)?,
                Event::End => {
                    let request = conn.receive_end()?;
                    let mut exchange = Exchange {
                        stream: &mut stream,
                        buf: &mut buf,
                        conn: &mut conn,
                        peer,
                        read_ahead_limit,
                    };
                    if exchange.respond(&app, request).await? == Disposition::Close {
                        if let Err(e) = stream.shutdown().await {
                            debug!(peer = %peer, error = %e, "shutdown after close failed");
                        }
                        return Ok(());
                    }
                }
            }
        }

        if stream.read_buf(&mut buf).await? == 0 {
            // Idle or mid-request: no response is owed.
            let action = conn.half_close();
            debug!(peer = %peer, ?action, "peer closed its sending side");
            return Ok(());
        }
    }
}

/// Decodes the next event, or `Ok(None)` when more bytes are needed.
///
/// Undecodable input is answered with an error response before the connection is
/// closed and the decode failure returned.
async fn next_event<S>(
    decoder: &mut RequestDecoder,
    buf: &mut BytesMut,
    conn: &mut Connection,
    stream: &mut S,
    peer: SocketAddr,
) -> Result<Option<Event>, ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    match decoder.decode(buf) {
        Ok(event) => Ok(event),
        Err(e) => {
            let status = e.status();
            warn!(peer = %peer, error = %e, status = status.as_u16(), "rejecting request");
            conn.close();
            buf.clear();
            ResponseWriter::new(stream)
                .reject(decoder.version(), status, &e.to_string())
                .await?;
            stream.shutdown().await?;
            Err(ConnectionError::Rejected(e))
        }
    }
}

/// One request/response exchange on a connection.
struct Exchange<'a, S> {
    stream: &'a mut S,
    buf: &'a mut BytesMut,
    conn: &'a mut Connection,
    peer: SocketAddr,
    read_ahead_limit: usize,
}

impl<S> Exchange<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handler, keeps reading (to buffer pipelined bytes and notice a
    /// half-close) while it is pending, then writes the response.
    ///
    /// If the read side fails while the handler is pending, the handler future is
    /// dropped, which releases any lease it holds.
    async fn respond(
        &mut self,
        app: &App,
        request: Request,
    ) -> Result<Disposition, ConnectionError> {
        let started = Instant::now();
        let head = request.head().clone();
        let outcome = app.call(request, Some(self.peer));
        tokio::pin!(outcome);

        let mut read_closed = false;
        let response = loop {
            let can_read = !read_closed && self.buf.len() < self.read_ahead_limit;
            tokio::select! {
                response = &mut outcome => break response,
                read = self.stream.read_buf(&mut *self.buf), if can_read => {
                    if read? == 0 {
                        read_closed = true;
                        let action = self.conn.half_close();
                        debug!(
                            peer = %self.peer,
                            ?action,
                            "peer half-closed while a response is pending"
                        );
                    }
                }
            }
        };

        self.conn.begin_response()?;
        let mut response = response;
        if !self.conn.keep_alive() && head.is_keep_alive() {
            // The peer half-closed; say so instead of letting it expect reuse.
            response.headers_mut().set("Connection", "close");
        }
        let status = response.status();
        let keep_alive = ResponseWriter::new(&mut *self.stream)
            .send(&head, response, self.conn.keep_alive())
            .await?;
        let disposition = self.conn.complete_response(keep_alive)?;

        info!(
            peer = %self.peer,
            method = %head.method(),
            path = %head.path(),
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use super::*;
    use crate::database::{MemoryBackend, PoolConfig};
    use crate::handler::HandlerError;
    use crate::http::{Body, Method, StatusCode};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn app() -> App {
        let mut router = Router::new();
        router
            .get("/api/ping", |_ctx| async {
                Ok::<_, HandlerError>(Response::json(StatusCode::Ok, &json!({"ok": true}))?)
            })
            .unwrap()
            .get("/slow", |_ctx| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Response::text(StatusCode::Ok, "slow"))
            })
            .unwrap()
            .post("/echo", |ctx| async move {
                Ok(Response::new(StatusCode::Ok).body_bytes(ctx.request().body().clone()))
            })
            .unwrap()
            .get("/stream", |_ctx| async {
                let (tx, body) = Body::channel(4);
                tokio::spawn(async move {
                    for part in ["one", "two"] {
                        if tx.send(part.into()).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(Response::new(StatusCode::Ok).streaming(body))
            })
            .unwrap();
        App::new(router)
    }

    type ServeTask = tokio::task::JoinHandle<Result<(), ConnectionError>>;

    fn spawn_server(app: App) -> (DuplexStream, ServeTask) {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            peer(),
            Arc::new(app),
            Limits::default(),
        ));
        (client, task)
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(
                b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /api/ping HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let text = read_all(&mut client).await;
        let slow = text.find("slow").unwrap();
        let ping = text.find(r#"{"ok":true}"#).unwrap();
        let missing = text.find("404 Not Found").unwrap();
        assert!(slow < ping && ping < missing, "{text}");
        assert_eq!(text.matches("HTTP/1.1 ").count(), 3);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn keep_alive_serves_multiple_requests() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(b"GET /api/ping HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut first = vec![0u8; 1024];
        let n = client.read(&mut first).await.unwrap();
        let first = String::from_utf8_lossy(&first[..n]).into_owned();
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!first.contains("Connection:"), "{first}");

        client
            .write_all(
                b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
            )
            .await
            .unwrap();
        let rest = read_all(&mut client).await;
        assert!(rest.contains("Connection: close\r\n"));
        assert!(rest.ends_with("\r\n\r\nhello"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn half_close_while_pending_still_delivers_response() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"), "{text}");
        assert!(text.ends_with("slow"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn half_close_when_idle_closes_quietly() {
        let (mut client, task) = spawn_server(app());
        client.shutdown().await.unwrap();
        assert_eq!(read_all(&mut client).await, "");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http10_closes_by_default() {
        let (mut client, task) = spawn_server(app());
        client.write_all(b"GET /api/ping HTTP/1.0\r\n\r\n").await.unwrap();
        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!text.contains("Connection: keep-alive"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn streamed_body_is_chunked() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(b"GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let text = read_all(&mut client).await;
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("3\r\none\r\n3\r\ntwo\r\n0\r\n\r\n"), "{text}");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_is_rejected_and_closed() {
        let (mut client, task) = spawn_server(app());
        client.write_all(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").await.unwrap();
        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"));
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::Rejected(_))));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 999999999\r\n\r\n")
            .await
            .unwrap();
        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{text}");
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Rejected(DecodeError::BodyTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn undecodable_framing_header_cannot_smuggle_a_request() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(
                b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\x80\r\n\r\n\
                  GET /api/ping HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert_eq!(text.matches("HTTP/1.1 ").count(), 1, "{text}");
        assert!(!text.contains(r#"{"ok":true}"#));
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Rejected(DecodeError::InvalidHeaderValue { .. }))
        ));
    }

    #[tokio::test]
    async fn rejection_uses_the_client_version() {
        let (mut client, task) = spawn_server(app());
        client
            .write_all(b"POST /echo HTTP/1.0\r\nContent-Length: 999999999\r\n\r\n")
            .await
            .unwrap();
        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.0 413 Payload Too Large\r\n"), "{text}");
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn dropped_connection_releases_lease() {
        let backend = MemoryBackend::new()
            .with_rows("select 1", json!([{"n": 1}]))
            .with_latency(Duration::from_secs(10));
        let pool = Pool::new(
            backend,
            PoolConfig {
                max_connections: 1,
                min_connections: 0,
                acquire_timeout: Duration::from_millis(100),
            },
        );
        pool.start().await.unwrap();

        let mut router = Router::new();
        router
            .leased(Method::Get, "/rows", |_req, db| {
                Box::pin(async move {
                    db.query("select 1").await?;
                    Ok::<_, HandlerError>(Response::new(StatusCode::NoContent))
                })
            })
            .unwrap();

        let (mut client, task) = spawn_server(App::new(router).with_pool(pool.clone()));
        client
            .write_all(b"GET /rows HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.stats().in_use, 1);

        task.abort();
        let _ = task.await;
        drop(client);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().acquired, pool.stats().released);
    }
}

//! The endpoints served by the `rivet` binary.
//!
//! `/api/*` endpoints answer JSON, the database-backed ones inside a lease.
//! `/dynamic/*` endpoints are diagnostics that exercise the transport: echoing the
//! body, reporting what the server saw, and streaming a response in pieces.

mod models;

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tracing::debug;

pub use models::{Category, CommonData, Place};

use crate::BoxFuture;
use crate::context::Context;
use crate::database::{MemoryBackend, Session};
use crate::handler::{HandlerError, HandlerResult};
use crate::http::{Body, Method, Request, Response, StatusCode};
use crate::router::{RouteError, Router};

pub const CATEGORIES_QUERY: &str = "select id, name from categories order by id asc";

pub const PLACES_QUERY: &str = "select id, created, updated, name, address, \
     latitude(coordinate) as latitude, longitude(coordinate) as longitude, \
     category_id as category from places";

const DEFAULT_TEXT: &str = "Hello World\r\n";

/// Pause between the pieces of `/dynamic/count-to-ten`.
pub const COUNT_DELAY: Duration = Duration::from_millis(100);

/// Pause between the lines of `/dynamic/continuous`.
pub const CONTINUOUS_DELAY: Duration = Duration::from_millis(400);

/// Largest piece `/dynamic/echo` sends back at once.
const ECHO_CHUNK: usize = 16 * 1024;

/// Builds the route table.
pub fn router() -> Result<Router, RouteError> {
    let mut router = Router::new();
    router
        .get("/api/ping", ping)?
        .leased(Method::Get, "/api/common-data", common_data)?
        .leased(Method::Get, "/api/places", places)?
        .post("/dynamic/echo", echo)?
        .post("/dynamic/echo_balloon", echo_balloon)?
        .get("/dynamic/info", info)?
        .get("/dynamic/pid", pid)?
        .get("/dynamic/client-ip", client_ip)?
        .get("/dynamic/write-delay", write_delay)?
        .get("/dynamic/count-to-ten", count_to_ten)?
        .get("/dynamic/continuous", continuous)?;
    Ok(router)
}

/// An in-memory backend holding a small fixed data set for the `/api/*` queries.
pub fn demo_backend() -> MemoryBackend {
    MemoryBackend::new()
        .with_rows(
            CATEGORIES_QUERY,
            json!([
                {"id": 1, "name": "Park"},
                {"id": 2, "name": "Cafe"},
                {"id": 3, "name": "Museum"},
            ]),
        )
        .with_rows(
            PLACES_QUERY,
            json!([
                {
                    "id": 1,
                    "created": "2023-04-01T10:00:00Z",
                    "updated": "2023-04-01T10:00:00Z",
                    "name": "Riverside Park",
                    "address": "1 River Rd",
                    "latitude": 50.0755,
                    "longitude": 14.4378,
                    "category": 1,
                },
                {
                    "id": 2,
                    "created": "2023-04-02T08:30:00Z",
                    "updated": "2023-05-11T16:45:00Z",
                    "name": "Corner Cafe",
                    "address": "12 Main St",
                    "latitude": 50.0810,
                    "longitude": 14.4280,
                    "category": 2,
                },
            ]),
        )
}

async fn ping(_ctx: Context) -> HandlerResult {
    Ok(Response::json(StatusCode::Ok, &json!({ "ok": true }))?)
}

fn common_data(_request: Request, db: &mut Session) -> BoxFuture<'_, HandlerResult> {
    Box::pin(load_common_data(db))
}

async fn load_common_data(db: &mut Session) -> HandlerResult {
    let categories: Vec<Category> = db.query_as(CATEGORIES_QUERY).await?;
    let data: CommonData = categories.into_iter().collect();
    Ok(Response::json(StatusCode::Ok, &data)?)
}

fn places(_request: Request, db: &mut Session) -> BoxFuture<'_, HandlerResult> {
    Box::pin(load_places(db))
}

async fn load_places(db: &mut Session) -> HandlerResult {
    let places: Vec<Place> = db.query_as(PLACES_QUERY).await?;
    Ok(Response::json(StatusCode::Ok, &places)?)
}

/// Sends the body back as a stream of pieces, without a `Content-Length`.
async fn echo(ctx: Context) -> HandlerResult {
    let request = ctx.request();
    let body = request.body().clone();
    let (tx, stream) = Body::channel(4);
    tokio::spawn(async move {
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + ECHO_CHUNK).min(body.len());
            if tx.send(body.slice(offset..end)).await.is_err() {
                debug!(sent = offset, "client went away during echo");
                return;
            }
            offset = end;
        }
    });
    Ok(with_content_type(Response::new(StatusCode::Ok), request).streaming(stream))
}

/// Sends the body back in one piece, framed by `Content-Length`.
async fn echo_balloon(ctx: Context) -> HandlerResult {
    let request = ctx.request();
    let response = Response::new(StatusCode::Ok).body_bytes(request.body().clone());
    Ok(with_content_type(response, request))
}

fn with_content_type(response: Response, request: &Request) -> Response {
    match request.headers().get("content-type") {
        Some(content_type) => response.header("Content-Type", content_type),
        None => response,
    }
}

async fn info(ctx: Context) -> HandlerResult {
    let request = ctx.request();
    let headers = request
        .headers()
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join(", ");
    let client = ctx
        .peer_addr()
        .map_or_else(|| "unknown".to_owned(), |addr| addr.to_string());

    let text = format!(
        "HTTP method: {}\r\nURL: {}\r\nbody length: {}\r\nheaders: [{headers}]\r\nclient: {client}\r\n",
        request.method(),
        request.head().uri(),
        request.body().len(),
    );
    Ok(Response::text(StatusCode::Ok, text))
}

async fn pid(_ctx: Context) -> HandlerResult {
    Ok(Response::text(StatusCode::Ok, std::process::id().to_string()))
}

async fn client_ip(ctx: Context) -> HandlerResult {
    let addr = ctx
        .peer_addr()
        .ok_or_else(|| HandlerError::Internal("peer address unavailable".into()))?;
    Ok(Response::text(StatusCode::Ok, addr.ip().to_string()))
}

async fn write_delay(_ctx: Context) -> HandlerResult {
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(Response::text(StatusCode::Ok, DEFAULT_TEXT))
}

/// Streams `1` through `10`, one piece per [`COUNT_DELAY`].
async fn count_to_ten(_ctx: Context) -> HandlerResult {
    let (tx, body) = Body::channel(1);
    tokio::spawn(async move {
        for n in 1..=10 {
            if n > 1 {
                tokio::time::sleep(COUNT_DELAY).await;
            }
            if tx.send(Bytes::from(n.to_string())).await.is_err() {
                debug!(sent = n - 1, "client went away during count-to-ten");
                return;
            }
        }
    });
    Ok(Response::new(StatusCode::Ok)
        .header("Content-Type", "text/plain; charset=utf-8")
        .streaming(body))
}

/// Streams `line 1`, `line 2`, ... every [`CONTINUOUS_DELAY`] until the client
/// goes away.
async fn continuous(_ctx: Context) -> HandlerResult {
    let (tx, body) = Body::channel(1);
    tokio::spawn(async move {
        let mut n: u64 = 0;
        loop {
            n += 1;
            if tx.send(Bytes::from(format!("line {n}\n"))).await.is_err() {
                debug!(sent = n - 1, "client went away during continuous");
                return;
            }
            tokio::time::sleep(CONTINUOUS_DELAY).await;
        }
    });
    Ok(Response::new(StatusCode::Ok)
        .header("Content-Type", "text/plain; charset=utf-8")
        .streaming(body))
}

//! Demo endpoints served behind the compression middleware

use serde::Serialize;
use squeeze_compression::CompressionMonitor;
use squeeze_core::{handler_fn, Body, Error, HandlerFn, Request, Response, StatusCode};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct Book {
    id: u32,
    title: String,
    author: &'static str,
    year: u16,
}

fn catalogue() -> Vec<Book> {
    const AUTHORS: [&str; 4] = [
        "Ursula K. Le Guin",
        "Octavia E. Butler",
        "Stanislaw Lem",
        "Iain M. Banks",
    ];

    (1..=50)
        .map(|id| Book {
            id,
            title: format!("Collected Works, Volume {id}"),
            author: AUTHORS[id as usize % AUTHORS.len()],
            year: 1960 + (id % 60) as u16,
        })
        .collect()
}

fn json(status: StatusCode, body: Vec<u8>) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::Internal(format!("JSON encoding failed: {e}")))
}

/// Routes for `/api/v1/books`, `/health` and `/stats`
pub(crate) fn handler(monitor: Arc<CompressionMonitor>) -> HandlerFn {
    handler_fn(move |req: Request<Body>| {
        let monitor = Arc::clone(&monitor);
        async move {
            match req.uri().path() {
                "/api/v1/books" => json(StatusCode::OK, encode(&catalogue())?),
                "/health" => json(StatusCode::OK, br#"{"status":"ok"}"#.to_vec()),
                "/stats" => json(StatusCode::OK, encode(&monitor.snapshot())?),
                _ => json(StatusCode::NOT_FOUND, br#"{"error":"not found"}"#.to_vec()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn get(handler: &HandlerFn, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(Body::default()).unwrap();
        let response = handler(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_routes() {
        let monitor = Arc::new(CompressionMonitor::new(CancellationToken::new()));
        monitor.record_observation("/api/v1/books", 400, 1600, Duration::from_millis(2));
        let handler = handler(Arc::clone(&monitor));

        let (status, books) = get(&handler, "/api/v1/books").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(books.as_array().unwrap().len(), 50);

        let (status, health) = get(&handler, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");

        let (_, stats) = get(&handler, "/stats").await;
        assert_eq!(stats["total_requests"], 1);
        assert_eq!(stats["overall_ratio"], 0.25);

        let (status, _) = get(&handler, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

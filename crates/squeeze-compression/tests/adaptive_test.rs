//! End-to-end tests for the adaptive compression middleware

use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use squeeze_compression::{AdaptiveCompression, AdaptiveConfig, CompressionMonitor};
use squeeze_core::{handler_fn, wrap, Body, Error, HandlerFn, Middleware};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn catalogue() -> String {
    let books: Vec<String> = (0..200)
        .map(|i| format!("{{\"id\":{i},\"title\":\"Volume {i}\",\"author\":\"Anon\"}}"))
        .collect();
    format!("[{}]", books.join(","))
}

fn books_handler() -> HandlerFn {
    handler_fn(|req: Request<Body>| async move {
        let body = match req.uri().path() {
            "/api/v1/books" => catalogue(),
            _ => "<html><body>not much here</body></html>".to_string(),
        };
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(Error::from)
    })
}

fn get(path: &str, accept: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::ACCEPT_ENCODING, accept)
        .body(Body::from(Bytes::new()))
        .unwrap()
}

async fn read_body(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_pipeline_compresses_and_tracks_paths() {
    let ctx = CancellationToken::new();
    let monitor = Arc::new(CompressionMonitor::new(ctx.clone()));
    let middleware = AdaptiveCompression::with_config(Arc::clone(&monitor), AdaptiveConfig::default())
        .unwrap();

    let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([Arc::new(middleware) as Arc<dyn Middleware>]);
    let handler = wrap(stack, books_handler());

    for _ in 0..3 {
        let response = handler(get("/api/v1/books", "gzip, deflate")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");

        let mut decoded = String::new();
        GzDecoder::new(&read_body(response).await[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, catalogue());
    }

    let plain = handler(get("/api/v1/books", "identity")).await.unwrap();
    assert!(!plain.headers().contains_key(header::CONTENT_ENCODING));
    assert_eq!(read_body(plain).await, catalogue().as_bytes());

    let stats = monitor.path_statistics("/api/v1/books").unwrap();
    assert_eq!(stats.request_count, 3);
    assert_eq!(stats.original_bytes, 3 * catalogue().len() as u64);
    assert!(stats.ratio > 0.0 && stats.ratio < 0.5);

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.total_requests, 3);
    assert_eq!(snapshot.total_failures, 0);
    assert_eq!(snapshot.tracked_paths, 1);

    monitor.shutdown(Duration::from_secs(1)).await.unwrap();
    monitor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_all_counted() {
    let monitor = Arc::new(CompressionMonitor::new(CancellationToken::new()));
    let middleware = AdaptiveCompression::with_config(Arc::clone(&monitor), AdaptiveConfig::default())
        .unwrap();
    let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([Arc::new(middleware) as Arc<dyn Middleware>]);
    let handler = Arc::new(wrap(stack, books_handler()));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler(get("/api/v1/books", "gzip")).await.unwrap() })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
    }

    assert_eq!(monitor.path_statistics("/api/v1/books").unwrap().request_count, 50);
    // Ten samples were reached but the row was evaluated less than a minute ago
    assert_eq!(monitor.current_level_config("/api/v1/books").adjustments, 0);
}

#[tokio::test]
async fn test_snapshot_serializes_for_reporting() {
    let monitor = CompressionMonitor::new(CancellationToken::new());
    monitor.record_observation("/a", 250, 1000, Duration::from_millis(4));
    monitor.record_failure("/a", "panic: boom");

    let json = serde_json::to_value(monitor.snapshot()).unwrap();
    assert_eq!(json["total_requests"], 1);
    assert_eq!(json["total_failures"], 1);
    assert_eq!(json["overall_ratio"], 0.25);
    assert_eq!(json["failure_reasons"]["panic: boom"], 1);
}

//! HTTP transport behavior against a minimal in-process collector endpoint.

use std::sync::Arc;
use std::time::Duration;

use spanrelay::{CollectorConfig, CollectorMetrics, SubCollector};
use spanrelay_wire as wire;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Accepts HTTP posts, answers with `status`, and forwards each body.
async fn start_http_sink(status: u16) -> (String, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                let (headers, mut body) = loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&raw[..split]).to_string();
                        break (headers, raw[split + 4..].to_vec());
                    }
                };
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::to_owned))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while body.len() < content_length {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    body.extend_from_slice(&buf[..n]);
                }
                let _ = tx.send((headers, body));
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (format!("http://{addr}/api/traces"), rx)
}

fn http_span(span_id: i64) -> wire::Span {
    wire::Span {
        trace_id_low: 101,
        trace_id_high: 0,
        span_id,
        parent_span_id: 0,
        operation_name: "http-post".to_owned(),
        flags: 0,
        start_time_us: 1_600_000_000_000_000,
        duration_us: 500,
        tags: Vec::new(),
        logs: Vec::new(),
    }
}

#[tokio::test]
async fn test_http_collector_posts_thrift_body() {
    let (endpoint, mut bodies) = start_http_sink(202).await;
    let mut cfg = CollectorConfig::new(endpoint, "http-svc");
    cfg.flush_interval = Duration::from_secs(3600);
    let collector = SubCollector::new(cfg, Arc::new(CollectorMetrics::new())).unwrap();

    collector.collect(http_span(9));
    collector.shutdown().await;

    let (headers, body) = tokio::time::timeout(Duration::from_secs(2), bodies.recv())
        .await
        .expect("no post arrived")
        .unwrap();
    assert!(headers.starts_with("POST /api/traces"));
    assert!(headers
        .to_ascii_lowercase()
        .contains("content-type: application/x-thrift"));
    let batch = wire::decode_batch(&body).unwrap();
    assert_eq!(batch.process.service_name, "http-svc");
    assert_eq!(batch.spans.len(), 1);
    assert_eq!(batch.spans[0].span_id, 9);
    assert_eq!(batch.seq_no, Some(1));
}

#[tokio::test]
async fn test_http_error_status_is_a_send_failure() {
    let (endpoint, mut bodies) = start_http_sink(503).await;
    let metrics = Arc::new(CollectorMetrics::new());
    let mut cfg = CollectorConfig::new(endpoint, "http-svc");
    cfg.flush_interval = Duration::from_secs(3600);
    let collector = SubCollector::new(cfg, metrics.clone()).unwrap();

    collector.collect(http_span(1));
    collector.shutdown().await;

    // The body reached the sink but the 503 made the send a failure; the
    // batch is discarded without retry.
    assert!(bodies.recv().await.is_some());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(bodies.try_recv().is_err(), "unexpected retry");
}

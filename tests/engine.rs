//! End-to-end runs against a local canned-response HTTP server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use http_loadgen::check::CheckSpec;
use http_loadgen::scenario::{Method, RequestTemplate, ScenarioConfig, StageConfig};
use http_loadgen::scheduler::Scheduler;

/// Minimal HTTP server that answers every request with 200 and counts hits.
async fn spawn_ok_server() -> (SocketAddr, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            let response = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: keep-alive\r\n\r\nok";
                            if socket.write_all(response.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, hits)
}

fn scenario(url: String, stages: Vec<StageConfig>, pacing_ms: u64) -> ScenarioConfig {
    ScenarioConfig {
        name: "test".to_string(),
        request: RequestTemplate {
            method: Method::GET,
            url,
            headers: HashMap::new(),
            body: None,
        },
        checks: vec![CheckSpec::StatusIs(200)],
        stages,
        pacing_ms,
        pacing_jitter: 0.0,
        timeout_ms: 2000,
    }
}

#[tokio::test]
async fn steady_single_user_counts_every_iteration() {
    let (addr, hits) = spawn_ok_server().await;
    let config = scenario(
        format!("http://{addr}/api/users"),
        vec![StageConfig::steady(1, Duration::from_millis(1500))],
        300,
    );

    let summary = Scheduler::new(config).unwrap().run().await;

    // One user, 300ms pacing, 1.5s window: roughly five iterations.
    assert!(
        (4..=6).contains(&summary.total_requests),
        "unexpected request count {}",
        summary.total_requests
    );
    assert_eq!(summary.total_requests, summary.total_iterations);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.error_rate, 0.0);
    assert_eq!(summary.status_counts[&200], summary.total_requests);
    assert_eq!(summary.checks["status is 200"].fails, 0);
    assert_eq!(summary.checks["status is 200"].passes, summary.total_requests);
    assert_eq!(hits.load(Ordering::Relaxed), summary.total_requests);
}

#[tokio::test]
async fn refused_connections_are_errors_not_crashes() {
    // Bind a port, then drop the listener so connections are refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = scenario(
        format!("http://{addr}/api/users"),
        vec![StageConfig::steady(2, Duration::from_millis(600))],
        100,
    );

    let summary = Scheduler::new(config).unwrap().run().await;

    assert!(summary.total_requests > 0);
    assert_eq!(summary.total_requests, summary.total_iterations);
    assert_eq!(summary.error_count, summary.total_requests);
    assert_eq!(summary.error_rate, 1.0);
    assert!(summary.status_counts.is_empty());
    assert_eq!(summary.checks["status is 200"].passes, 0);
    assert_eq!(summary.checks["status is 200"].fails, summary.total_requests);
}

#[tokio::test]
async fn ramp_up_then_down_records_all_iterations() {
    let (addr, hits) = spawn_ok_server().await;
    let config = scenario(
        format!("http://{addr}/"),
        vec![
            StageConfig::ramp(4, Duration::from_millis(600)),
            StageConfig::ramp(0, Duration::from_millis(600)),
        ],
        50,
    );

    let summary = Scheduler::new(config).unwrap().run().await;

    assert!(summary.total_requests > 0);
    assert_eq!(summary.total_requests, summary.total_iterations);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.status_counts[&200], summary.total_requests);
    assert_eq!(hits.load(Ordering::Relaxed), summary.total_requests);
}

#[tokio::test]
async fn shutdown_handle_stops_a_long_run_early() {
    let (addr, _hits) = spawn_ok_server().await;
    let config = scenario(
        format!("http://{addr}/"),
        vec![StageConfig::steady(2, Duration::from_secs(300))],
        50,
    );

    let scheduler = Scheduler::new(config).unwrap();
    let handle = scheduler.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.stop();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("run did not stop after the shutdown signal");

    assert!(summary.total_requests > 0);
    assert_eq!(summary.total_requests, summary.total_iterations);
}

#[tokio::test]
async fn templated_auth_header_reaches_the_wire() {
    // Server that checks the Authorization header before answering 200.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let request = String::from_utf8_lossy(&buf[..n]);
                            let status = if request.contains("authorization: Basic secret")
                                || request.contains("Authorization: Basic secret")
                            {
                                "200 OK"
                            } else {
                                "401 Unauthorized"
                            };
                            let response = format!(
                                "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: keep-alive\r\n\r\n"
                            );
                            if socket.write_all(response.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let mut config = scenario(
        format!("http://{addr}/api/users"),
        vec![StageConfig::steady(1, Duration::from_millis(400))],
        100,
    );
    config
        .request
        .headers
        .insert("Authorization".to_string(), "Basic secret".to_string());

    let summary = Scheduler::new(config).unwrap().run().await;

    assert!(summary.total_requests > 0);
    assert_eq!(summary.checks["status is 200"].fails, 0);
    assert_eq!(summary.status_counts.get(&401), None);
}

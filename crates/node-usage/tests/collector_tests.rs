use mockito::{Matcher, Server};
use node_common::UsageReport;
use node_usage::{HttpUsageCollector, UsageCollector, UsageError};
use serde_json::json;
use std::time::Duration;

fn report() -> UsageReport {
    let mut report = UsageReport::default();
    report.push(1, 80);
    report.push(3, 4096);
    report
}

#[tokio::test]
async fn test_submit_posts_json_with_api_key() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/usage/report")
        .match_header("x-api-key", "node-secret")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({
            "usages": [
                {"instanceId": 1, "totalUsageInBytes": 80},
                {"instanceId": 3, "totalUsageInBytes": 4096}
            ]
        })))
        .with_status(200)
        .create_async()
        .await;

    let collector = HttpUsageCollector::new(
        &server.url(),
        "/api/usage/report",
        Some("node-secret".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();

    collector.submit(&report()).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/usage/report")
        .with_status(503)
        .with_body("collector overloaded")
        .create_async()
        .await;

    let collector =
        HttpUsageCollector::new(&server.url(), "api/usage/report", None, Duration::from_secs(5))
            .unwrap();

    let err = collector.submit(&report()).await.unwrap_err();
    match err {
        UsageError::CollectorRejected { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "collector overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_collector_is_an_http_error() {
    // Nothing listens on the discard port.
    let collector = HttpUsageCollector::new(
        "http://127.0.0.1:9",
        "/api/usage/report",
        None,
        Duration::from_secs(2),
    )
    .unwrap();

    let err = collector.submit(&report()).await.unwrap_err();
    assert!(matches!(err, UsageError::Http(_)));
}

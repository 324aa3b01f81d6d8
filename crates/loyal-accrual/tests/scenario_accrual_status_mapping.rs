//! HTTP status and body mapping against a mock accrual authority.

use std::time::Duration;

use httpmock::prelude::*;
use loyal_accrual::{AccrualGateway, AccrualOutcome, GatewayConfig, HttpAccrualGateway};
use loyal_schemas::Points;

const ORDER: &str = "4561261212345467";

fn gateway(server: &MockServer) -> HttpAccrualGateway {
    HttpAccrualGateway::new(GatewayConfig {
        base_url: server.base_url(),
        timeout: Duration::from_millis(500),
    })
    .expect("gateway")
}

#[tokio::test]
async fn processed_with_accrual() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/orders/{ORDER}"));
            then.status(200)
                .header("content-type", "application/json")
                .body(format!(
                    r#"{{"order":"{ORDER}","status":"PROCESSED","accrual":300}}"#
                ));
        })
        .await;

    let got = gateway(&server).fetch_status(ORDER).await;
    m.assert_async().await;
    assert_eq!(got, AccrualOutcome::Processed(Points::whole(300)));
}

#[tokio::test]
async fn registered_and_processing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/orders/18");
            then.status(200)
                .body(r#"{"order":"18","status":"REGISTERED"}"#);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/orders/26");
            then.status(200)
                .body(r#"{"order":"26","status":"PROCESSING"}"#);
        })
        .await;

    let gw = gateway(&server);
    assert_eq!(gw.fetch_status("18").await, AccrualOutcome::Registered);
    assert_eq!(gw.fetch_status("26").await, AccrualOutcome::Processing);
}

#[tokio::test]
async fn no_content_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/orders/{ORDER}"));
            then.status(204);
        })
        .await;

    assert_eq!(
        gateway(&server).fetch_status(ORDER).await,
        AccrualOutcome::NotFound
    );
}

#[tokio::test]
async fn too_many_requests_carries_retry_after() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/orders/{ORDER}"));
            then.status(429)
                .header("Retry-After", "5")
                .body("No more than N requests per minute allowed");
        })
        .await;

    assert_eq!(
        gateway(&server).fetch_status(ORDER).await,
        AccrualOutcome::RateLimited(Duration::from_secs(5))
    );
}

#[tokio::test]
async fn too_many_requests_without_header_is_transport_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/orders/{ORDER}"));
            then.status(429);
        })
        .await;

    let got = gateway(&server).fetch_status(ORDER).await;
    assert!(matches!(got, AccrualOutcome::TransportError(_)), "{got:?}");
}

#[tokio::test]
async fn server_error_and_garbage_body_are_transport_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/orders/18");
            then.status(500);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/orders/26");
            then.status(200).body("<html>oops</html>");
        })
        .await;

    let gw = gateway(&server);
    assert!(matches!(
        gw.fetch_status("18").await,
        AccrualOutcome::TransportError(_)
    ));
    assert!(matches!(
        gw.fetch_status("26").await,
        AccrualOutcome::TransportError(_)
    ));
}

#[tokio::test]
async fn slow_authority_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/orders/{ORDER}"));
            then.status(200)
                .delay(Duration::from_secs(2))
                .body(r#"{"status":"PROCESSING"}"#);
        })
        .await;

    let got = gateway(&server).fetch_status(ORDER).await;
    assert!(matches!(got, AccrualOutcome::TransportError(_)), "{got:?}");
}

#[tokio::test]
async fn unreachable_authority_is_transport_error() {
    let gw = HttpAccrualGateway::new(GatewayConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout: Duration::from_millis(500),
    })
    .expect("gateway");

    assert!(matches!(
        gw.fetch_status(ORDER).await,
        AccrualOutcome::TransportError(_)
    ));
}

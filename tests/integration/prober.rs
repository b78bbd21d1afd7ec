//! Probe behavior against real sockets
//!
//! These tests verify that:
//! - HTTP status codes are matched against the allowed list
//! - TCP connects succeed on a live listener and fail on a closed port
//! - The network policy refuses loopback targets unless private networks are allowed
//! - Slow targets are reported as timeouts

use guardia_watch::config::EngineSettings;
use guardia_watch::model::{StatusMatcher, TargetKind};
use guardia_watch::prober::{Probe, ProbeError, Prober};
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::helpers::*;

fn private_allowed() -> EngineSettings {
    EngineSettings {
        allow_private_networks: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_http_status_sequence() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let prober = Prober::new().unwrap();
    let target = http_target(1, &format!("{}/health", mock_server.uri()));
    let settings = private_allowed();

    let first = prober.probe(&target, &settings).await;
    let second = prober.probe(&target, &settings).await;
    let third = prober.probe(&target, &settings).await;

    assert!(first.ok);
    assert_eq!(first.status_code, Some(200));
    assert!(second.ok);
    assert!(!third.ok);
    assert_eq!(third.error, Some(ProbeError::DisallowedStatus(500)));
    assert_eq!(third.status_code, Some(500));
}

#[tokio::test]
async fn test_http_allowed_status_list() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let prober = Prober::new().unwrap();
    let mut target = http_target(1, &mock_server.uri());
    let settings = private_allowed();

    assert!(!prober.probe(&target, &settings).await.ok);

    if let TargetKind::Http { allowed_status, .. } = &mut target.kind {
        allowed_status.push(StatusMatcher::Range(200, 299));
        allowed_status.push(StatusMatcher::Code(404));
    }
    assert!(prober.probe(&target, &settings).await.ok);
}

#[tokio::test]
async fn test_http_timeout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&mock_server)
        .await;

    let prober = Prober::new().unwrap();
    let mut target = http_target(1, &mock_server.uri());
    target.timeout_seconds = Some(1);

    let result = prober.probe(&target, &private_allowed()).await;

    assert!(!result.ok);
    assert!(
        matches!(result.error, Some(ProbeError::Timeout(_))),
        "expected a timeout, got {:?}",
        result.error
    );
    assert!(result.latency < Duration::from_secs(3));
}

#[tokio::test]
async fn test_loopback_blocked_by_default() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let prober = Prober::new().unwrap();
    let target = http_target(1, &mock_server.uri());

    let result = prober.probe(&target, &EngineSettings::default()).await;

    assert!(!result.ok);
    assert!(matches!(result.error, Some(ProbeError::PolicyBlocked(_))));
    assert!(
        mock_server.received_requests().await.unwrap().is_empty(),
        "no request may reach a blocked target"
    );
}

#[tokio::test]
async fn test_tcp_live_and_closed_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let prober = Prober::new().unwrap();
    let mut target = tcp_target(1, "local");
    target.kind = TargetKind::Tcp {
        host: "127.0.0.1".to_string(),
        port,
    };

    let live = prober.probe(&target, &private_allowed()).await;
    assert!(live.ok, "live listener should be up: {:?}", live.error);
    assert_eq!(live.status_code, None);

    // grab a free port and release it so nothing listens there
    let closed_port = {
        let probe_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe_listener.local_addr().unwrap().port()
    };
    target.kind = TargetKind::Tcp {
        host: "127.0.0.1".to_string(),
        port: closed_port,
    };

    let closed = prober.probe(&target, &private_allowed()).await;
    assert!(!closed.ok);
    assert!(matches!(closed.error, Some(ProbeError::Refused(_))));

    let blocked = prober.probe(&target, &EngineSettings::default()).await;
    assert!(matches!(blocked.error, Some(ProbeError::PolicyBlocked(_))));
}

#[tokio::test]
async fn test_invalid_url_is_reported() {
    let prober = Prober::new().unwrap();
    let target = http_target(1, "ftp://files.example.com/");

    let result = prober.probe(&target, &EngineSettings::default()).await;

    assert!(!result.ok);
    assert!(matches!(result.error, Some(ProbeError::InvalidTarget(_))));
}

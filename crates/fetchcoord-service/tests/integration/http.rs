use std::time::Duration;

use fetchcoord_service::config::Config;
use fetchcoord_service::error::FetchError;
use fetchcoord_service::transport::{HttpTransport, Transport};
use fetchcoord_test::HitCounter;

fn transport(config: &Config) -> HttpTransport {
    HttpTransport::new(config).unwrap()
}

#[tokio::test]
async fn test_fetch_bytes() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let transport = transport(&Config::default());

    let bytes = transport.fetch(&server.url("bytes/hello")).await.unwrap();
    assert_eq!(bytes.as_deref(), Some(&b"hello"[..]));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_error_status() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let transport = transport(&Config::default());

    let result = transport
        .fetch(&server.url("respond_statuscode/404/foo"))
        .await;
    assert_eq!(
        result.unwrap_err(),
        FetchError::Transport("HTTP status 404 Not Found".into())
    );

    let result = transport
        .fetch(&server.url("respond_statuscode/500/foo"))
        .await;
    assert_eq!(
        result.unwrap_err(),
        FetchError::Transport("HTTP status 500 Internal Server Error".into())
    );
}

#[tokio::test]
async fn test_no_content() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let transport = transport(&Config::default());

    let result = transport
        .fetch(&server.url("respond_statuscode/204/foo"))
        .await;
    assert_eq!(result, Ok(None));
}

#[tokio::test]
async fn test_timeout() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let config = Config {
        max_download_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let transport = transport(&config);

    let result = transport.fetch(&server.url("delay/1s/slow")).await;
    assert!(matches!(result, Err(FetchError::Transport(_))));
}

#[tokio::test]
async fn test_connection_refused() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let url = server.url("bytes/gone");
    drop(server);

    let transport = transport(&Config::default());
    let result = transport.fetch(&url).await;
    assert!(matches!(result, Err(FetchError::Transport(_))));
}

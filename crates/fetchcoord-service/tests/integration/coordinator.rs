use std::sync::Arc;

use fetchcoord_service::config::Config;
use fetchcoord_service::coordinator::Coordinator;
use fetchcoord_service::decode::{RawDecoder, Utf8Decoder};
use fetchcoord_service::error::FetchError;
use fetchcoord_service::transport::HttpTransport;
use fetchcoord_test::HitCounter;

fn coordinator() -> Coordinator<HttpTransport, Utf8Decoder> {
    let config = Config::default();
    let transport = HttpTransport::new(&config).unwrap();
    Coordinator::new(transport, Utf8Decoder, &config)
}

#[tokio::test]
async fn test_concurrent_gets_hit_server_once() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let coordinator = coordinator();
    let url = server.url("delay/50ms/shared");

    let results = futures::future::join_all((0..10).map(|_| coordinator.get(url.clone()))).await;

    let first = results[0].clone().unwrap();
    assert_eq!(first.as_str(), "shared");
    for result in &results {
        assert!(Arc::ptr_eq(&first, result.as_ref().unwrap()));
    }
    assert_eq!(server.hits("delay/50ms/shared"), 1);

    // served from the cache from now on
    coordinator.get(url).await.unwrap();
    assert_eq!(server.hits("delay/50ms/shared"), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let coordinator = coordinator();
    let url = server.url("respond_statuscode/503/flaky");

    for _ in 0..2 {
        let result = coordinator.get(url.clone()).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_no_content_is_data_missing() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let config = Config::default();
    let transport = HttpTransport::new(&config).unwrap();
    let coordinator = Coordinator::new(transport, RawDecoder, &config);

    let result = coordinator
        .get(server.url("respond_statuscode/204/empty"))
        .await;
    assert_eq!(result.unwrap_err(), FetchError::DataMissing);
}

#[tokio::test]
async fn test_cancel_all_over_http() {
    fetchcoord_test::setup();
    let server = HitCounter::new();
    let coordinator = coordinator();
    let url = server.url("delay/1s/slow");
    let (sender, receiver) = std::sync::mpsc::channel();

    for _ in 0..2 {
        let sender = sender.clone();
        coordinator.fetch(url.clone(), None, move |result, _| {
            sender.send(result).ok();
        });
    }
    coordinator.cancel_all(&url);

    for _ in 0..2 {
        assert_eq!(receiver.try_recv().unwrap().unwrap_err(), FetchError::Cancelled);
    }
    assert!(!coordinator.is_in_flight(&url));
}

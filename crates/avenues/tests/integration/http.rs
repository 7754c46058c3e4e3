use std::time::Duration;

use avenues::config::HttpConfig;
use avenues::producer::create_client;
use avenues::{Avenue, HttpProducer, MemoryCache, ProduceError, ResourceState};
use avenues_test::{HitCounter, Recorder, setup};
use bytes::Bytes;
use url::Url;

type HttpAvenue = Avenue<&'static str, Url, Bytes>;

fn http_avenue(timeout: Duration) -> HttpAvenue {
    let config = HttpConfig {
        timeout,
        ..HttpConfig::default()
    };
    let client = create_client(&config).unwrap();
    let producer = HttpProducer::new(tokio::runtime::Handle::current(), client, timeout);
    Avenue::new(producer, MemoryCache::new())
}

async fn final_state(recorder: &Recorder<Bytes>, claimer: &'static str) -> ResourceState<Bytes> {
    recorder.wait_for(claimer, 2).await.pop().unwrap()
}

#[tokio::test]
async fn test_download_is_shared() {
    setup();

    let server = HitCounter::new();
    let avenue = http_avenue(Duration::from_secs(5));
    let recorder = Recorder::new();

    let url = server.url("garbage_data/hello");
    avenue.register("A", url.clone(), recorder.callback("A"));
    avenue.register("B", url.clone(), recorder.callback("B"));

    let arrived = ResourceState::Arrived(Bytes::from("hello"));
    assert_eq!(final_state(&recorder, "A").await, arrived);
    assert_eq!(final_state(&recorder, "B").await, arrived);
    assert_eq!(server.accesses(), 1);

    avenue.register("C", url.clone(), recorder.callback("C"));
    assert_eq!(
        recorder.states("C"),
        vec![ResourceState::Existing(Bytes::from("hello"))]
    );
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_download_errors() {
    setup();

    let server = HitCounter::new();
    let avenue = http_avenue(Duration::from_secs(5));
    let recorder = Recorder::new();

    avenue.register(
        "missing",
        server.url("respond_statuscode/404/file"),
        recorder.callback("missing"),
    );
    avenue.register(
        "forbidden",
        server.url("respond_statuscode/403/file"),
        recorder.callback("forbidden"),
    );
    avenue.register(
        "broken",
        server.url("respond_statuscode/500/file"),
        recorder.callback("broken"),
    );

    assert_eq!(
        final_state(&recorder, "missing").await,
        ResourceState::Failed(ProduceError::NotFound)
    );
    assert_eq!(
        final_state(&recorder, "forbidden").await,
        ResourceState::Failed(ProduceError::PermissionDenied("403 Forbidden".into()))
    );
    assert_eq!(
        final_state(&recorder, "broken").await,
        ResourceState::Failed(ProduceError::Download("500 Internal Server Error".into()))
    );
}

#[tokio::test]
async fn test_download_timeout() {
    setup();

    let server = HitCounter::new();
    let timeout = Duration::from_millis(100);
    let avenue = http_avenue(timeout);
    let recorder = Recorder::new();

    avenue.register(
        "A",
        server.url("delay/2000/garbage_data/slow"),
        recorder.callback("A"),
    );

    assert_eq!(
        final_state(&recorder, "A").await,
        ResourceState::Failed(ProduceError::Timeout(timeout))
    );
}

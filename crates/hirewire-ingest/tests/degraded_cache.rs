//! End-to-end fetch cycle over a `wiremock` upstream with a cache that fails
//! every call. The cycle must still complete on live fetches alone.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hirewire_ingest::{FetchCycle, PoolSizes, RecordingPublisher};
use hirewire_source::{CachingSourceClient, SourceClientConfig};
use hirewire_storage::{FailingCache, HttpClientConfig, HttpFetcher};

async fn mount_json(server: &MockServer, at: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn cycle_completes_when_cache_is_down() {
    let server = MockServer::start().await;

    mount_json(
        &server,
        "/search",
        json!({
            "hits": [{"objectID": "1", "title": "Ask HN: Who is hiring? (October 2026)", "author": "whoishiring"}],
            "nbHits": 1
        }),
    )
    .await;
    mount_json(
        &server,
        "/item/1.json",
        json!({
            "id": 1,
            "title": "Ask HN: Who is hiring? (October 2026)",
            "by": "whoishiring",
            "time": 1_790_000_000,
            "kids": [10, 11, 12],
            "type": "story"
        }),
    )
    .await;
    for id in [10, 11, 12] {
        mount_json(
            &server,
            &format!("/item/{id}.json"),
            json!({
                "id": id,
                "text": format!("Company {id} | Remote | Senior Engineer"),
                "by": format!("user{id}"),
                "time": 1_790_000_100,
                "parent": 1,
                "type": "comment"
            }),
        )
        .await;
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
    })
    .expect("fetcher");
    let source = CachingSourceClient::new(
        http,
        Arc::new(FailingCache),
        SourceClientConfig {
            api_base_url: server.uri(),
            search_base_url: server.uri(),
            cache_ttl: Duration::from_secs(60),
        },
    );
    let publisher = Arc::new(RecordingPublisher::new());

    let summary = FetchCycle::new(Arc::new(source), publisher.clone(), PoolSizes::default())
        .run(&CancellationToken::new())
        .await
        .expect("cycle should complete without a cache");

    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.hiring_threads_found, 1);
    assert_eq!(summary.comments_processed, 3);
    assert_eq!(publisher.published_ids(), vec!["10", "11", "12"]);
}

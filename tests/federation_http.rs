//! End-to-end searches through the HTTP surface against mock backends.

use axum::http::StatusCode;
use serde_json::Value;

mod common;

use common::{client, config, ids, patient, start_backend, start_broker, start_failing_backend};

#[tokio::test]
async fn test_sorted_search_and_continuation() {
    let a = start_backend(vec![patient("1", "Alice"), patient("3", "Carol")]).await;
    let b = start_backend(vec![patient("2", "Bob"), patient("4", "Eve")]).await;
    let broker = start_broker(config(vec![a.server_config("a"), b.server_config("b")])).await;
    let client = client();

    let res = client
        .get(broker.url("/Patient?_sort=name&_count=2"))
        .send()
        .await
        .expect("broker unreachable");
    assert_eq!(res.status(), StatusCode::OK);
    let first: Value = res.json().await.unwrap();
    assert_eq!(ids(&first), vec!["1", "2"]);
    assert_eq!(first["strategy"], "parallel");
    let token = first["continuation"].as_str().expect("continuation").to_string();

    let res = client
        .get(broker.url("/Patient"))
        .query(&[("_sort", "name"), ("_count", "2"), ("_continuation", token.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second: Value = res.json().await.unwrap();
    assert_eq!(ids(&second), vec!["3", "4"]);
    assert!(second["continuation"].is_null());
}

#[tokio::test]
async fn test_full_scan_has_no_gaps_or_repeats() {
    let a = start_backend((0..7).map(|i| patient(&format!("a{i}"), &format!("n{:02}", i * 2))).collect()).await;
    let b = start_backend((0..5).map(|i| patient(&format!("b{i}"), &format!("n{:02}", i * 2 + 1))).collect()).await;
    let broker = start_broker(config(vec![a.server_config("a"), b.server_config("b")])).await;
    let client = client();

    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    for _ in 0..10 {
        let mut query = vec![("_sort", "name".to_string()), ("_count", "3".to_string())];
        if let Some(t) = &token {
            query.push(("_continuation", t.clone()));
        }
        let body: Value = client
            .get(broker.url("/Patient"))
            .query(&query)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        seen.extend(ids(&body));
        token = body["continuation"].as_str().map(str::to_string);
        if token.is_none() {
            break;
        }
    }

    assert_eq!(seen.len(), 12);
    let mut unique = seen.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 12);
    // Names interleave a/b in ascending order.
    assert_eq!(&seen[..4], &["a0", "b0", "a1", "b1"]);
}

#[tokio::test]
async fn test_degraded_server_reported() {
    let good = start_backend(vec![patient("1", "Alice")]).await;
    let bad = start_failing_backend(StatusCode::INTERNAL_SERVER_ERROR).await;
    let broker = start_broker(config(vec![good.server_config("good"), bad.server_config("bad")])).await;

    let res = client().get(broker.url("/Patient")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(ids(&body), vec!["1"]);
    assert_eq!(body["degraded"][0]["server"], "bad");
    assert_eq!(body["degraded"][0]["kind"], "unexpected_response");
    assert!(body["total"].is_null());
    assert_eq!(bad.calls(), 1);
}

#[tokio::test]
async fn test_all_servers_failing_is_bad_gateway() {
    let a = start_failing_backend(StatusCode::SERVICE_UNAVAILABLE).await;
    let b = start_failing_backend(StatusCode::INTERNAL_SERVER_ERROR).await;
    let broker = start_broker(config(vec![a.server_config("a"), b.server_config("b")])).await;

    let res = client().get(broker.url("/Patient?name=x")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "all_servers_failed");
    assert_eq!(body["failures"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_invalid_token_is_bad_request() {
    let a = start_backend(vec![patient("1", "Alice")]).await;
    let broker = start_broker(config(vec![a.server_config("a")])).await;

    let res = client()
        .get(broker.url("/Patient?_continuation=not-a-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_query");
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let a = start_backend(vec![patient("1", "Alice")]).await;
    let mut config = config(vec![a.server_config("a")]);
    config.limits.max_queries_per_minute = 1;
    let broker = start_broker(config).await;
    let client = client();

    let res = client
        .get(broker.url("/Patient"))
        .header("x-client-id", "tenant-1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(broker.url("/Patient"))
        .header("x-client-id", "tenant-1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().contains_key("retry-after"));

    let res = client
        .get(broker.url("/Patient"))
        .header("x-client-id", "tenant-2")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_and_request_id() {
    let a = start_backend(Vec::new()).await;
    let broker = start_broker(config(vec![a.server_config("a")])).await;

    let res = client().get(broker.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["servers"], 1);
}

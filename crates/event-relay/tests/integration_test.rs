// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use event_relay::{
    config::RelayConfig,
    relay::RunningRelay,
    rudderstack::{self, APP_NAME},
};
use mockito::{Matcher, Server};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};

// base64("integration-key:")
const AUTHORIZATION_VALUE: &str = "Basic aW50ZWdyYXRpb24ta2V5Og==";

fn relay_config(url: String) -> RelayConfig {
    RelayConfig {
        write_key: "integration-key".to_string(),
        data_plane_url: url,
        buffer_limit_bytes: 1024 * 1024,
        flush_interval_secs: 3600,
        retry_base_delay_ms: 1,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

#[cfg(test)]
#[tokio::test]
async fn relay_retries_failed_batch_until_delivered() {
    let mut server = Server::new_async().await;

    let failing = server
        .mock("POST", "/v1/batch")
        .match_header("Authorization", AUTHORIZATION_VALUE)
        .with_status(500)
        .with_body("Internal Server Error")
        .expect_at_least(1)
        .create_async()
        .await;

    let config = RelayConfig {
        buffer_limit_bytes: 1,
        ..relay_config(format!("{}/v1/batch", server.url()))
    };
    let running =
        RunningRelay::start(&config, rudderstack::default_mapper()).expect("failed to start");

    running.relay().process_event(&json!({
        "event": "$pageview",
        "distinct_id": "user-1",
        "properties": {"$current_url": "https://example.com/", "$pathname": "/"}
    }));

    let first = async {
        while !failing.matched_async().await {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), first)
        .await
        .expect("timed out before the first delivery attempt");

    failing.remove_async().await;
    let succeeding = server
        .mock("POST", "/v1/batch")
        .match_header("Content-Type", "application/json")
        .match_header("Authorization", AUTHORIZATION_VALUE)
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""type":"page""#.to_string()),
            Matcher::Regex(r#""userId":"user-1""#.to_string()),
            Matcher::Regex(r#""url":"https://example\.com/""#.to_string()),
            Matcher::Regex(format!(r#""app":\{{"name":"{APP_NAME}"\}}"#)),
            Matcher::Regex(r#""sentAt":""#.to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let retry = async {
        while !succeeding.matched_async().await {
            sleep(Duration::from_millis(10)).await;
        }
    };
    let result = timeout(Duration::from_secs(5), retry).await;

    running.shutdown(Duration::from_secs(1)).await;
    match result {
        Ok(()) => succeeding.assert_async().await,
        Err(_) => panic!("timed out before the retried batch was delivered"),
    }
}

#[cfg(test)]
#[tokio::test]
async fn relay_flushes_pending_events_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/batch")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""event":"signup""#.to_string()),
            Matcher::Regex(r#""type":"identify""#.to_string()),
            Matcher::Regex(r#""traits":\{"plan":"pro"\}"#.to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let running = RunningRelay::start(
        &relay_config(format!("{}/v1/batch", server.url())),
        rudderstack::default_mapper(),
    )
    .expect("failed to start");

    let relay = running.relay();
    relay.process_event(&json!({"event": "signup", "distinct_id": "u"}));
    relay.process_event(&json!({"event": "$identify", "distinct_id": "u", "$set": {"plan": "pro"}}));
    assert_eq!(relay.buffer().len(), 2);

    running.shutdown(Duration::from_secs(5)).await;

    assert!(relay.buffer().is_empty());
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn relay_delivers_each_size_triggered_batch_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/batch")
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    let config = RelayConfig {
        buffer_limit_bytes: 1,
        ..relay_config(format!("{}/v1/batch", server.url()))
    };
    let running =
        RunningRelay::start(&config, rudderstack::default_mapper()).expect("failed to start");

    let relay = running.relay();
    for name in ["a", "b", "c"] {
        relay.process_event(&json!({"event": name}));
    }

    running.shutdown(Duration::from_secs(5)).await;
    mock.assert_async().await;
}

//! Throttling retries: backoff, Retry-After, and terminal statuses.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use polarai::config::ApiKey;
use polarai::dispatch::ChatMessage;
use polarai::dispatch::http::{HttpDispatch, RequestSpec};
use polarai::dispatch::retry::RetryPolicy;
use polarai::error::BridgeError;
use polarai::providers::grok::{GrokChatRequest, GrokClient, GrokSettings};

use common::{json_response, response, serve};

const CHAT_OK: &str = r#"{"id":"c1","created":1,"model":"grok-3","choices":[{"index":0,"message":{"role":"assistant","content":"hello there"},"finish_reason":"stop"}]}"#;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(5),
        min_delay_between_requests: Duration::ZERO,
    }
}

/// Three 429s (the second with Retry-After: 1), then 200.
async fn throttled_then_ok() -> common::MockServer {
    let calls = Arc::new(AtomicUsize::new(0));
    serve(move |_req| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        match n {
            0 | 2 => json_response(429, r#"{"error":"slow down"}"#),
            1 => response(429, "application/json", &[("Retry-After", "1")], b"{}"),
            _ => json_response(200, CHAT_OK),
        }
    })
    .await
}

#[tokio::test]
async fn three_throttles_then_success_with_non_decreasing_delays() {
    let server = throttled_then_ok().await;
    let http = HttpDispatch::new();
    let spec = RequestSpec::post_json(server.url("/chat/completions"), serde_json::json!({}));

    let reply = http
        .send_with_retry("xai", &spec, &fast_policy())
        .await
        .unwrap();

    assert_eq!(reply.value.status, 200);
    assert_eq!(reply.retries(), 3);
    assert!(reply.delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", reply.delays);
    assert_eq!(reply.delays[0], Duration::from_millis(50));
    // Retry-After raised the second delay; the third may not drop below it.
    assert_eq!(reply.delays[1], Duration::from_secs(1));
    assert_eq!(reply.delays[2], Duration::from_secs(1));
    assert_eq!(server.count("/chat/completions"), 4);
}

#[tokio::test]
async fn retries_exhausted_returns_last_status() {
    let server = serve(|_req| json_response(503, "overloaded")).await;
    let http = HttpDispatch::new();
    let spec = RequestSpec::get(server.url("/models"));
    let policy = RetryPolicy {
        max_retries: 2,
        ..fast_policy()
    };

    let err = http.send_with_retry("xai", &spec, &policy).await.unwrap_err();
    match err {
        BridgeError::Http { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("expected Http, got {other:?}"),
    }
    assert_eq!(server.count("/models"), 3);
}

#[tokio::test]
async fn non_retryable_status_fails_on_first_attempt() {
    let server = serve(|_req| json_response(400, r#"{"error":"bad model"}"#)).await;
    let http = HttpDispatch::new();
    let spec = RequestSpec::get(server.url("/x"));

    let err = http
        .send_with_retry("xai", &spec, &fast_policy())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(server.count("/x"), 1);
}

#[tokio::test]
async fn grok_chat_recovers_from_throttling() {
    let server = throttled_then_ok().await;
    let settings = GrokSettings {
        api_key: ApiKey::new("xai-test"),
        base_url: server.url(""),
        retry_base_delay_secs: 0.05,
        max_retry_delay_secs: 5.0,
        min_delay_between_requests_secs: 0.0,
        ..GrokSettings::default()
    };
    let client = GrokClient::new(settings, Arc::new(HttpDispatch::new()));

    let response = client
        .chat(GrokChatRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap();
    assert_eq!(response.text(), Some("hello there"));

    let requests = server.recorded();
    assert_eq!(requests.len(), 4);
    let last = requests.last().unwrap();
    assert!(last.headers.contains("authorization: bearer xai-test"));
    let body = last.json();
    assert_eq!(body["model"], "grok-4-fast-reasoning");
    assert_eq!(body["messages"][0]["content"], "hi");
}

#[tokio::test]
async fn grok_without_key_never_sends() {
    let server = serve(|_req| json_response(200, CHAT_OK)).await;
    let settings = GrokSettings {
        base_url: server.url(""),
        ..GrokSettings::default()
    };
    let client = GrokClient::new(settings, Arc::new(HttpDispatch::new()));

    let err = client
        .chat(GrokChatRequest::new(vec![ChatMessage::user("hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::MissingApiKey { env_var: "XAI_API_KEY", .. }));
    assert!(server.recorded().is_empty());
}

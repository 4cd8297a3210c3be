//! Exactly-one-callback delivery over real provider calls.

mod common;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use polarai::config::ApiKey;
use polarai::dispatch::callback::deliver;
use polarai::dispatch::http::HttpDispatch;
use polarai::media::Decoded;
use polarai::providers::gemini::{GeminiClient, GeminiSettings};
use polarai::providers::groq::{GroqClient, GroqSettings};
use serde_json::json;

use common::{json_response, png_bytes, serve};

fn groq(url: String) -> GroqClient {
    let settings = GroqSettings {
        api_key: ApiKey::new("gsk-test"),
        url,
        ..GroqSettings::default()
    };
    GroqClient::new(settings, Arc::new(HttpDispatch::new()))
}

#[tokio::test]
async fn well_formed_reply_fires_one_success_callback() {
    let server = serve(|_req| {
        json_response(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"  pong \n"}}]}"#,
        )
    })
    .await;
    let client = groq(server.url("/openai/v1/chat/completions"));

    let mut successes = Vec::new();
    let mut errors = Vec::new();
    let ok = deliver(
        client.send("user", "ping"),
        |text| successes.push(text),
        |e| errors.push(e),
    )
    .await;

    assert!(ok);
    assert_eq!(successes, vec!["pong".to_string()]);
    assert!(errors.is_empty());

    let req = &server.recorded()[0];
    assert_eq!(req.method, "POST");
    assert!(req.headers.contains("authorization: bearer gsk-test"));
    let body = req.json();
    assert_eq!(body["model"], "openai/gpt-oss-120b");
    assert_eq!(body["temperature"], 0.2);
    assert_eq!(body["messages"][0]["role"], "user");
    assert!(body.get("max_tokens").is_none());
}

#[tokio::test]
async fn non_2xx_fires_one_error_callback_with_status_and_body() {
    let server = serve(|_req| json_response(500, r#"{"error":"upstream exploded"}"#)).await;
    let client = groq(server.url("/openai/v1/chat/completions"));

    let mut successes: Vec<String> = Vec::new();
    let mut errors = Vec::new();
    let ok = deliver(
        client.send("user", "ping"),
        |text| successes.push(text),
        |e| errors.push(e),
    )
    .await;

    assert!(!ok);
    assert!(successes.is_empty());
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("500"), "{}", errors[0]);
    assert!(errors[0].contains("upstream exploded"), "{}", errors[0]);
}

#[tokio::test]
async fn empty_choices_is_an_error_not_a_blank_success() {
    let server = serve(|_req| json_response(200, r#"{"choices":[]}"#)).await;
    let client = groq(server.url("/chat"));

    let mut errors = Vec::new();
    let ok = deliver(client.send("user", "ping"), |_| {}, |e| errors.push(e)).await;

    assert!(!ok);
    assert!(errors[0].contains("empty"), "{}", errors[0]);
}

#[tokio::test]
async fn decoded_image_moves_to_the_success_callback() {
    let b64 = BASE64.encode(png_bytes());
    let server = serve(move |_req| {
        json_response(
            200,
            &json!({"candidates":[{"content":{"parts":[
                {"inlineData":{"mimeType":"image/png","data": b64}}
            ]}}]})
            .to_string(),
        )
    })
    .await;
    let settings = GeminiSettings {
        api_key: ApiKey::new("g-key"),
        base_url: server.url(""),
        ..GeminiSettings::default()
    };
    let client = GeminiClient::new(settings, Arc::new(HttpDispatch::new()));

    let mut delivered = None;
    let mut errors = Vec::new();
    let ok = deliver(
        async { client.generate_image("a fox").await.map(Decoded::Image) },
        |d| delivered = Some(d),
        |e| errors.push(e),
    )
    .await;

    assert!(ok);
    assert!(errors.is_empty());
    match delivered.unwrap() {
        Decoded::Image(image) => {
            assert_eq!(image.mime_type, "image/png");
            assert_eq!(image.bytes, png_bytes());
        }
        other => panic!("expected an image, got {}", other.kind()),
    }
}

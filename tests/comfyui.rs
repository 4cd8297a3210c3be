//! ComfyUI job lifecycle: submit, poll /history, progress, download, timeout, cancel.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use polarai::config::Config;
use polarai::dispatch::callback::{Progress, ProgressFn};
use polarai::dispatch::http::HttpDispatch;
use polarai::dispatch::registry::{ImageRequest, Registry};
use polarai::error::BridgeError;
use polarai::providers::comfyui::{ComfyUiClient, ComfyUiRequest, ComfyUiSettings};
use polarai::tools::enums::ProviderKind;
use tokio::net::TcpListener;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use common::{Recorded, json_response, png_bytes, read_request, response, serve};

const PROMPT_ID: &str = "p-1";
const HISTORY_DONE: &str = r#"{"p-1":{"prompt":[],"outputs":{"8":{"images":[{"filename":"PolarAI_00001_.png","subfolder":"","type":"output"}]}},"status":{"completed":true}}}"#;

fn settings(base_url: String) -> ComfyUiSettings {
    ComfyUiSettings {
        base_url,
        poll_interval_secs: 0.05,
        max_wait_secs: 5.0,
        use_websocket_progress: false,
        checkpoint: "sd15.safetensors".to_string(),
        ..ComfyUiSettings::default()
    }
}

fn request(prompt: &str) -> ComfyUiRequest {
    ComfyUiRequest {
        positive_prompt: prompt.to_string(),
        seed: 42,
        ..ComfyUiRequest::default()
    }
}

fn collector() -> (ProgressFn, Arc<Mutex<Vec<Progress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let f: ProgressFn = Arc::new(move |p: Progress| sink.lock().unwrap().push(p));
    (f, seen)
}

/// Routes for a job whose history fills in after `ready_after` polls.
fn comfy_routes(ready_after: usize) -> impl Fn(&Recorded) -> Vec<u8> + Send + Sync + 'static {
    let polls = AtomicUsize::new(0);
    move |req: &Recorded| match req.path() {
        "/prompt" => json_response(200, r#"{"prompt_id":"p-1","number":1,"node_errors":{}}"#),
        "/history/p-1" => {
            if polls.fetch_add(1, Ordering::SeqCst) >= ready_after {
                json_response(200, HISTORY_DONE)
            } else {
                json_response(200, "{}")
            }
        }
        "/view" => response(200, "image/png", &[], &png_bytes()),
        _ => json_response(404, "{}"),
    }
}

#[tokio::test]
async fn history_without_images_polls_until_max_wait_then_times_out() {
    let server = serve(|req| match req.path() {
        "/prompt" => json_response(200, r#"{"prompt_id":"p-1"}"#),
        _ => json_response(200, r#"{"p-1":{"outputs":{}}}"#),
    })
    .await;
    let client = ComfyUiClient::new(
        ComfyUiSettings {
            max_wait_secs: 0.3,
            ..settings(server.url(""))
        },
        Arc::new(HttpDispatch::new()),
    );
    let (progress, seen) = collector();

    let start = Instant::now();
    let err = client
        .generate_image(&request("a castle"), Some(progress))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(server.count("/history/p-1") >= 3);
    assert_eq!(server.count("/view"), 0);

    // No socket, so pseudo progress stays under 10%.
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|p| p.message == "waiting for result..."));
    assert!(seen.iter().all(|p| p.fraction <= 0.1));
}

#[tokio::test]
async fn completed_job_downloads_first_image() {
    let server = serve(comfy_routes(2)).await;
    let client = ComfyUiClient::new(settings(server.url("")), Arc::new(HttpDispatch::new()));
    let (progress, seen) = collector();

    let image = client
        .generate_image(&request("a castle"), Some(progress))
        .await
        .unwrap();
    assert_eq!(image.mime_type, "image/png");
    assert_eq!(image.bytes, png_bytes());
    assert_eq!(server.count("/history/p-1"), 3);

    let requests = server.recorded();
    let submit = requests.iter().find(|r| r.path() == "/prompt").unwrap();
    let body = submit.json();
    assert_eq!(body["client_id"], "PolarAI");
    assert_eq!(body["prompt"]["2"]["inputs"]["ckpt_name"], "sd15.safetensors");
    assert_eq!(body["prompt"]["3"]["inputs"]["text"], "a castle");
    assert_eq!(body["prompt"]["5"]["inputs"]["seed"], 42);

    let view = requests.iter().find(|r| r.path() == "/view").unwrap();
    assert_eq!(
        view.target,
        "/view?filename=PolarAI_00001_.png&subfolder=&type=output"
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().unwrap().message, "submitting job...");
    let last = seen.last().unwrap();
    assert_eq!(last.fraction, 1.0);
    assert_eq!(last.message, "generation finished, downloading image...");
}

#[tokio::test]
async fn missing_prompt_id_is_a_decode_error_with_raw_body() {
    let server = serve(|_req| json_response(200, r#"{"error":"invalid prompt","node_errors":{}}"#)).await;
    let client = ComfyUiClient::new(settings(server.url("")), Arc::new(HttpDispatch::new()));

    let err = client.generate_image(&request("x"), None).await.unwrap_err();
    match err {
        BridgeError::Decode { message, .. } => assert!(message.contains("invalid prompt"), "{message}"),
        other => panic!("expected Decode, got {other:?}"),
    }
    assert_eq!(server.count("/history/p-1"), 0);
}

#[tokio::test]
async fn empty_checkpoint_everywhere_is_rejected_before_submit() {
    let server = serve(comfy_routes(0)).await;
    let client = ComfyUiClient::new(
        ComfyUiSettings {
            checkpoint: String::new(),
            ..settings(server.url(""))
        },
        Arc::new(HttpDispatch::new()),
    );

    let err = client.generate_image(&request("x"), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidRequest(_)));
    assert!(server.recorded().is_empty());
}

#[tokio::test]
async fn cancel_current_stops_polling() {
    let server = serve(comfy_routes(usize::MAX)).await;
    let client = ComfyUiClient::new(settings(server.url("")), Arc::new(HttpDispatch::new()));

    let req = request("x");
    let (result, ()) = tokio::join!(client.generate_image(&req, None), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.cancel_current();
    });

    assert!(matches!(result, Err(BridgeError::Cancelled { .. })), "{result:?}");
    assert_eq!(server.count("/view"), 0);
}

#[tokio::test]
async fn websocket_progress_is_forwarded_for_this_prompt_only() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let ws_done = Arc::new(AtomicBool::new(false));
    let ws_path = Arc::new(Mutex::new(String::new()));

    {
        let ws_done = Arc::clone(&ws_done);
        let ws_path = Arc::clone(&ws_path);
        tokio::spawn(async move {
            let polls_after_ws = Arc::new(AtomicUsize::new(0));
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let ws_done = Arc::clone(&ws_done);
                let ws_path = Arc::clone(&ws_path);
                let polls_after_ws = Arc::clone(&polls_after_ws);
                tokio::spawn(async move {
                    let mut peek = [0u8; 16];
                    let n = socket.peek(&mut peek).await.unwrap_or(0);
                    if peek[..n].starts_with(b"GET /ws") {
                        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            *ws_path.lock().unwrap() = req.uri().to_string();
                            Ok(resp)
                        };
                        let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback)
                            .await
                            .unwrap();
                        for frame in [
                            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#,
                            r#"{"type":"executing","data":{"node":"5","prompt_id":"p-1"}}"#,
                            r#"{"type":"progress","data":{"value":3,"max":20,"prompt_id":"other","node":"5"}}"#,
                            r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"p-1","node":"5"}}"#,
                        ] {
                            ws.send(Message::Text(frame.to_string())).await.unwrap();
                        }
                        ws_done.store(true, Ordering::SeqCst);
                        while let Some(Ok(_)) = ws.next().await {}
                        return;
                    }

                    let Some(req) = read_request(&mut socket).await else {
                        return;
                    };
                    let reply = match req.path() {
                        "/prompt" => json_response(200, r#"{"prompt_id":"p-1"}"#),
                        "/history/p-1" => {
                            let ready = ws_done.load(Ordering::SeqCst)
                                && polls_after_ws.fetch_add(1, Ordering::SeqCst) >= 2;
                            json_response(200, if ready { HISTORY_DONE } else { "{}" })
                        }
                        "/view" => response(200, "image/png", &[], &png_bytes()),
                        _ => json_response(404, "{}"),
                    };
                    let _ = socket.write_all(&reply).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
    }

    let client = ComfyUiClient::new(
        ComfyUiSettings {
            use_websocket_progress: true,
            poll_interval_secs: 0.1,
            ..settings(format!("http://127.0.0.1:{port}"))
        },
        Arc::new(HttpDispatch::new()),
    );
    let (progress, seen) = collector();

    client
        .generate_image(&request("a castle"), Some(progress))
        .await
        .unwrap();

    assert_eq!(*ws_path.lock().unwrap(), "/ws?clientId=PolarAI");
    let seen = seen.lock().unwrap();
    let messages: Vec<&str> = seen.iter().map(|p| p.message.as_str()).collect();
    assert!(messages.contains(&"executing node 5..."), "{messages:?}");
    let step = seen.iter().find(|p| p.message == "step 5/20 (5)").unwrap();
    assert_eq!(step.fraction, 0.25);
    assert!(!messages.iter().any(|m| m.starts_with("step 3/")));
    // A listening socket replaces the time-based pseudo progress.
    assert!(!messages.contains(&"waiting for result..."));
}

#[tokio::test]
async fn registry_saves_comfyui_image_to_output_dir() {
    let server = serve(comfy_routes(0)).await;
    let output_dir = std::env::temp_dir().join(format!("polarai-out-{}", std::process::id()));
    let mut config = Config::default();
    config.output_dir = output_dir.clone();
    config.comfyui = settings(server.url(""));
    let registry = Registry::from_config(config);

    let mut req = ImageRequest::new("a lighthouse", Instant::now() + Duration::from_secs(10));
    req.width = Some(640);
    req.loras = vec!["film.safetensors".to_string()];

    let saved = registry
        .generate_image(ProviderKind::Comfyui, &req)
        .await
        .unwrap();
    assert_eq!(saved.provider, "comfyui");
    assert_eq!(saved.mime_type, "image/png");
    assert!(saved.path.starts_with(&output_dir));
    assert_eq!(saved.path.extension().unwrap(), "png");
    assert_eq!(tokio::fs::read(&saved.path).await.unwrap(), png_bytes());

    let body = server
        .recorded()
        .into_iter()
        .find(|r| r.path() == "/prompt")
        .unwrap()
        .json();
    assert_eq!(body["prompt"]["6"]["inputs"]["width"], 640);
    assert_eq!(body["prompt"]["9"]["inputs"]["lora_name"], "film.safetensors");

    let _ = tokio::fs::remove_dir_all(&output_dir).await;
}

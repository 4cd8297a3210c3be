use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the channel between a receive task and its consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenControl {
    Continue,
    Stop,
}

fn ws_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::WebSocket(e.to_string())
}

/// Turn an HTTP(S) base URL into the matching WS(S) URL and append `path`.
pub fn ws_url_from_http(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}{path}")
}

/// Open a WebSocket with extra handshake headers.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<WsStream, BridgeError> {
    let mut request = url.into_client_request().map_err(ws_err)?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(ws_err)?;
        let value = HeaderValue::from_str(value).map_err(ws_err)?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(ws_err)?;
    tracing::debug!(url = url, "websocket connected");
    Ok(stream)
}

/// Feed every text message to `on_text` until it returns `Stop`, the server
/// closes, or `stop` fires. Binary frames are treated as UTF-8 text.
pub async fn listen<F>(
    mut ws: WsStream,
    stop: CancellationToken,
    mut on_text: F,
) -> Result<(), BridgeError>
where
    F: FnMut(&str) -> ListenControl,
{
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            msg = ws.next() => msg,
        };

        let text = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(ws_err(e)),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "websocket closed by server");
                return Ok(());
            }
            Some(Ok(_)) => continue,
        };

        if on_text(&text) == ListenControl::Stop {
            break;
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}

/// Spawn a task forwarding the text frames of `stream` into a bounded channel.
///
/// The task waits for room in the channel, so a slow consumer slows the socket
/// read instead of growing a queue. It ends when the server closes, `stop`
/// fires, or the receiver is dropped; a read error is delivered as the last item.
pub fn spawn_reader(
    mut stream: SplitStream<WsStream>,
    stop: CancellationToken,
) -> mpsc::Receiver<Result<String, BridgeError>> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return,
                msg = stream.next() => msg,
            };
            let item = match next {
                None | Some(Ok(Message::Close(_))) => return,
                Some(Err(e)) => {
                    let _ = tx.send(Err(ws_err(e))).await;
                    return;
                }
                Some(Ok(Message::Text(text))) => Ok(text),
                Some(Ok(Message::Binary(bytes))) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Some(Ok(_)) => continue,
            };
            if tx.send(item).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            ws_url_from_http("http://127.0.0.1:8188/", "/ws?clientId=x"),
            "ws://127.0.0.1:8188/ws?clientId=x"
        );
        assert_eq!(
            ws_url_from_http("https://api.openai.com/v1", "/realtime"),
            "wss://api.openai.com/v1/realtime"
        );
        assert_eq!(ws_url_from_http("ws://host", "/a"), "ws://host/a");
    }
}

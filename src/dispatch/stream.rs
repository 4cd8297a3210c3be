use std::time::Instant;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

/// What one decoded stream line contributed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamStep {
    pub delta: Option<String>,
    /// Provider signalled end of stream (`done: true`, `[DONE]`).
    pub done: bool,
}

impl StreamStep {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            delta: None,
            done: true,
        }
    }

    pub fn skip() -> Self {
        Self::default()
    }
}

/// Accumulated text of a streamed response.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamOutcome {
    pub text: String,
    /// True when the stream was cut short by cancellation, the deadline, or a
    /// mid-stream transport error after some text arrived.
    pub partial: bool,
}

/// Splits a byte stream into newline-delimited lines.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte UTF-8 sequences split
/// across chunks decode correctly. Blank lines are dropped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Flush a trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

struct Accumulator<'a> {
    text: String,
    on_delta: &'a mut (dyn FnMut(&str) + Send),
}

impl Accumulator<'_> {
    fn apply(&mut self, step: StreamStep) -> bool {
        if let Some(delta) = step.delta
            && !delta.is_empty()
        {
            (self.on_delta)(&delta);
            self.text.push_str(&delta);
        }
        step.done
    }

    fn complete(self) -> StreamOutcome {
        StreamOutcome {
            text: self.text,
            partial: false,
        }
    }

    fn partial(self) -> StreamOutcome {
        StreamOutcome {
            text: self.text,
            partial: true,
        }
    }
}

/// Drive a newline-delimited JSON body to completion.
///
/// `parse` turns each line into a [`StreamStep`]; `on_delta` sees every non-empty
/// token as it arrives. Cancellation or the deadline return what was
/// accumulated so far with `partial = true`.
pub async fn read_ndjson<P>(
    provider: &str,
    response: reqwest::Response,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
    mut parse: P,
    on_delta: &mut (dyn FnMut(&str) + Send),
) -> Result<StreamOutcome, BridgeError>
where
    P: FnMut(&str) -> Result<StreamStep, BridgeError>,
{
    let mut acc = Accumulator {
        text: String::new(),
        on_delta,
    };
    let mut decoder = NdjsonDecoder::new();
    let mut stream = std::pin::pin!(response.bytes_stream());

    loop {
        let next = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => {
                tracing::info!(provider = provider, "stream cancelled, returning partial text");
                return Ok(acc.partial());
            }
            _ = wait_deadline(deadline) => {
                tracing::warn!(provider = provider, "stream deadline reached, returning partial text");
                return Ok(acc.partial());
            }
            item = stream.next() => item,
        };

        match next {
            None => break,
            Some(Err(e)) => {
                if acc.text.is_empty() {
                    return Err(BridgeError::Request(e));
                }
                tracing::warn!(provider = provider, "stream broke mid-response: {e}");
                return Ok(acc.partial());
            }
            Some(Ok(bytes)) => {
                for line in decoder.push(&bytes) {
                    if acc.apply(parse(&line)?) {
                        return Ok(acc.complete());
                    }
                }
            }
        }
    }

    if let Some(line) = decoder.finish() {
        acc.apply(parse(&line)?);
    }
    Ok(acc.complete())
}

/// Drive a `text/event-stream` body to completion. A `data: [DONE]` event ends
/// the stream; `parse` handles every other event's data.
pub async fn read_sse<P>(
    provider: &str,
    response: reqwest::Response,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
    mut parse: P,
    on_delta: &mut (dyn FnMut(&str) + Send),
) -> Result<StreamOutcome, BridgeError>
where
    P: FnMut(&str) -> Result<StreamStep, BridgeError>,
{
    let mut acc = Accumulator {
        text: String::new(),
        on_delta,
    };
    let mut events = std::pin::pin!(response.bytes_stream().eventsource());

    loop {
        let next = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => {
                tracing::info!(provider = provider, "stream cancelled, returning partial text");
                return Ok(acc.partial());
            }
            _ = wait_deadline(deadline) => {
                tracing::warn!(provider = provider, "stream deadline reached, returning partial text");
                return Ok(acc.partial());
            }
            item = events.next() => item,
        };

        match next {
            None => return Ok(acc.complete()),
            Some(Err(e)) => {
                if acc.text.is_empty() {
                    return Err(BridgeError::decode(provider, format!("SSE stream error: {e}")));
                }
                tracing::warn!(provider = provider, "SSE stream broke mid-response: {e}");
                return Ok(acc.partial());
            }
            Some(Ok(event)) => {
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    return Ok(acc.complete());
                }
                if acc.apply(parse(data)?) {
                    return Ok(acc.complete());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_emits_complete_lines_only() {
        let mut d = NdjsonDecoder::new();
        assert!(d.push(b"{\"a\":").is_empty());
        assert_eq!(d.push(b"1}\n{\"b\":2}\n{\"c\""), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(d.finish().as_deref(), Some("{\"c\""));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn decoder_skips_blank_lines_and_crlf() {
        let mut d = NdjsonDecoder::new();
        assert_eq!(d.push(b"\n\r\n{\"x\":1}\r\n"), vec!["{\"x\":1}"]);
    }

    #[test]
    fn decoder_handles_utf8_split_across_chunks() {
        let mut d = NdjsonDecoder::new();
        let bytes = "héllo\n".as_bytes();
        let (a, b) = bytes.split_at(2);
        assert!(d.push(a).is_empty());
        assert_eq!(d.push(b), vec!["héllo"]);
    }
}

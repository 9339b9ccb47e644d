use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::instrument;

use linkup_core::errors::GatewayError;
use linkup_core::messages::ChatTurn;
use linkup_core::provider::{GenerationProvider, StreamOptions};
use linkup_core::security::ApiKey;
use linkup_core::stream::TokenEvent;

use crate::sse::{self, ChunkParser};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiProvider {
    client: Client,
    api_key: ApiKey,
    base_url: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: ApiKey, model: Option<&str>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Point at a non-default endpoint (proxies, self-hosted gateways, tests).
    pub fn with_base_url(api_key: ApiKey, model: Option<&str>, base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }

    fn build_request(
        &self,
        turns: &[ChatTurn],
        options: &StreamOptions,
    ) -> reqwest::RequestBuilder {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": turns,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }

        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.0.expose_secret()),
            )
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .json(&body)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, turns, options), fields(model = %self.model, turns = turns.len()))]
    async fn stream_completion(
        &self,
        turns: &[ChatTurn],
        options: &StreamOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = TokenEvent> + Send>>, GatewayError> {
        let resp = self
            .build_request(turns, options)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(TokenSseStream::new(byte_stream)))
    }
}

/// Wraps a byte stream from reqwest and yields TokenEvents.
/// Includes an idle timeout — if no data arrives within `idle_duration`, emits an error.
struct TokenSseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChunkParser,
    buffer: String,
    pending: Vec<TokenEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    terminated: bool,
}

impl TokenSseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChunkParser::new(),
            buffer: String::new(),
            // Start emitted on first poll, ahead of any parsed data
            pending: vec![TokenEvent::Start],
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            terminated: false,
        }
    }

    fn drain_buffer(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos + 2].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();
            for data in sse::parse_sse_data(&frame) {
                self.pending.extend(self.parser.parse_data(&data));
            }
        }
    }
}

impl Stream for TokenSseStream {
    type Item = TokenEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.terminated {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received — reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);
                    self.drain_buffer();

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.terminated = true;
                    return std::task::Poll::Ready(Some(TokenEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    self.terminated = true;
                    // Process whatever is left in the buffer
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        for data in sse::parse_sse_data(&remaining) {
                            let events = self.parser.parse_data(&data);
                            self.pending.extend(events);
                        }
                    }
                    // Connection closed without the [DONE] sentinel
                    if !self.parser.is_finished() {
                        self.pending.push(TokenEvent::Error {
                            error: GatewayError::StreamInterrupted(
                                "stream closed before [DONE]".into(),
                            ),
                        });
                    }
                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    // No data available — check idle timeout
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.terminated = true;
                        return std::task::Poll::Ready(Some(TokenEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn chunk(s: &str) -> Result<bytes::Bytes, reqwest::Error> {
        Ok(bytes::Bytes::from(s.to_string()))
    }

    #[test]
    fn provider_properties() {
        let provider = OpenAiProvider::new(ApiKey::new("sk-test"), Some("gpt-4o"));
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-4o");
    }

    #[test]
    fn default_model_used_when_none() {
        let provider = OpenAiProvider::new(ApiKey::new("sk-test"), None);
        assert_eq!(provider.model(), DEFAULT_MODEL);
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let provider =
            OpenAiProvider::with_base_url(ApiKey::new("k"), None, "http://localhost:8080/");
        assert_eq!(provider.base_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn sse_stream_yields_tokens_in_order() {
        let frames = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"Think\"},\"finish_reason\":null}]}\n\n"),
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\" big\"},\"finish_reason\":null}]}\n\n"),
            chunk("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n"),
        ];
        let byte_stream = futures::stream::iter(frames);
        let mut stream = Box::pin(TokenSseStream::new(byte_stream));

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(events[0], TokenEvent::Start));
        assert!(matches!(&events[1], TokenEvent::Delta { delta } if delta == "Think"));
        assert!(matches!(&events[2], TokenEvent::Delta { delta } if delta == " big"));
        match events.last().unwrap() {
            TokenEvent::Done { text } => assert_eq!(text, "Think big"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_stream_handles_split_frames() {
        // A frame split across two network reads must still parse
        let frames = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"con"),
            chunk("tent\":\"half\"},\"finish_reason\":null}]}\n\n"),
            chunk("data: [DONE]\n\n"),
        ];
        let byte_stream = futures::stream::iter(frames);
        let mut stream = Box::pin(TokenSseStream::new(byte_stream));

        let mut deltas = Vec::new();
        while let Some(event) = stream.next().await {
            if let TokenEvent::Delta { delta } = event {
                deltas.push(delta);
            }
        }
        assert_eq!(deltas, vec!["half"]);
    }

    #[tokio::test]
    async fn sse_stream_missing_done_is_interrupted() {
        let frames = vec![chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n",
        )];
        let byte_stream = futures::stream::iter(frames);
        let mut stream = Box::pin(TokenSseStream::new(byte_stream));

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(
            events.last().unwrap(),
            TokenEvent::Error {
                error: GatewayError::StreamInterrupted(_)
            }
        ));
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(TokenSseStream::with_idle_timeout(
            byte_stream,
            Duration::from_secs(5),
        ));

        // First poll yields the Start event without touching the wire
        let start = stream.next().await;
        assert!(matches!(start, Some(TokenEvent::Start)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(matches!(
            event,
            Some(TokenEvent::Error {
                error: GatewayError::StreamInterrupted(_)
            })
        ));
    }
}

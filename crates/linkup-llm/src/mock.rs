use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::Stream;

use linkup_core::errors::GatewayError;
use linkup_core::messages::ChatTurn;
use linkup_core::provider::{GenerationProvider, StreamOptions};
use linkup_core::stream::TokenEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone)]
pub enum MockResponse {
    /// Yield a sequence of TokenEvents.
    Stream(Vec<TokenEvent>),
    /// Return an error from the stream_completion() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: a single-delta text response.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_tokens(&[text])
    }

    /// Convenience: one delta per token, Done carries the concatenation.
    pub fn stream_tokens(tokens: &[&str]) -> Self {
        let mut events = vec![TokenEvent::Start];
        events.extend(tokens.iter().map(|t| TokenEvent::Delta {
            delta: (*t).to_string(),
        }));
        events.push(TokenEvent::Done {
            text: tokens.concat(),
        });
        Self::Stream(events)
    }

    /// Convenience: emit some deltas, then fail mid-stream.
    pub fn stream_then_fail(tokens: &[&str], error: GatewayError) -> Self {
        let mut events = vec![TokenEvent::Start];
        events.extend(tokens.iter().map(|t| TokenEvent::Delta {
            delta: (*t).to_string(),
        }));
        events.push(TokenEvent::Error { error });
        Self::Stream(events)
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream_completion(
        &self,
        _turns: &[ChatTurn],
        _options: &StreamOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = TokenEvent> + Send>>, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(response) = self.responses.get(idx) else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(
    response: &MockResponse,
) -> Result<Pin<Box<dyn Stream<Item = TokenEvent> + Send>>, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => {
                let events = events.clone();
                return Ok(Box::pin(stream::iter(events)));
            }
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn turns() -> Vec<ChatTurn> {
        vec![ChatTurn::user("hello")]
    }

    #[tokio::test]
    async fn token_stream_in_order() {
        let mock = MockProvider::new(vec![MockResponse::stream_tokens(&["a", "b", "c"])]);
        let mut stream = mock
            .stream_completion(&turns(), &StreamOptions::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.len(), 5); // Start, 3 deltas, Done
        assert!(matches!(events[0], TokenEvent::Start));
        assert!(matches!(&events[1], TokenEvent::Delta { delta } if delta == "a"));
        assert!(matches!(&events[3], TokenEvent::Delta { delta } if delta == "c"));
        match &events[4] {
            TokenEvent::Done { text } => assert_eq!(text, "abc"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mid_stream_failure() {
        let mock = MockProvider::new(vec![MockResponse::stream_then_fail(
            &["one", "two", "three"],
            GatewayError::StreamInterrupted("connection reset".into()),
        )]);
        let mut stream = mock
            .stream_completion(&turns(), &StreamOptions::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.len(), 5); // Start, 3 deltas, Error
        assert!(matches!(events.last().unwrap(), TokenEvent::Error { .. }));
    }

    #[tokio::test]
    async fn call_error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock.stream_completion(&turns(), &StreamOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::stream_text("second"),
        ]);

        assert!(mock.stream_completion(&turns(), &StreamOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 1);

        assert!(mock.stream_completion(&turns(), &StreamOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);

        let _ = mock.stream_completion(&turns(), &StreamOptions::default()).await;
        let result = mock.stream_completion(&turns(), &StreamOptions::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn provider_properties() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.name(), "mock");
        assert_eq!(mock.model(), "mock-model");
    }

    #[tokio::test]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::stream_text("after delay"),
        )]);

        let start = std::time::Instant::now();
        let mut stream = mock
            .stream_completion(&turns(), &StreamOptions::default())
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(40),
            "Delay should have waited ~50ms, got {:?}",
            elapsed
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
    }
}

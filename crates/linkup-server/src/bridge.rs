use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use linkup_core::ids::ConversationId;
use linkup_core::messages::{ChatRole, ChatTurn};
use linkup_core::provider::{GenerationProvider, StreamOptions};
use linkup_core::stream::TokenEvent;
use linkup_store::{ConversationRepo, StoreError};
use linkup_telemetry::MetricsRecorder;

/// Terminal frame after the last token of a successful reply.
pub const END_SENTINEL: &str = "[END]";
/// Terminal frame when the upstream generation fails.
pub const ERROR_SENTINEL: &str = "[ERROR]";

const FRAME_QUEUE: usize = 256;

/// Relays an upstream token stream to one requesting client and persists the
/// assembled reply when the upstream completes.
///
/// Each request gets its own relay task and accumulation buffer; concurrent
/// requests for different conversations never share state.
pub struct StreamingBridge {
    provider: Arc<dyn GenerationProvider>,
    conversations: Arc<ConversationRepo>,
    options: StreamOptions,
    metrics: Option<Arc<MetricsRecorder>>,
}

/// A live reply relay: `frames` yields the payload of each wire frame in
/// order (tokens, then one terminal sentinel). `task` completes once the
/// upstream is drained and persistence has run.
pub struct ReplyStream {
    pub frames: mpsc::Receiver<String>,
    pub task: tokio::task::JoinHandle<()>,
}

impl StreamingBridge {
    pub fn new(provider: Arc<dyn GenerationProvider>, conversations: Arc<ConversationRepo>) -> Self {
        Self {
            provider,
            conversations,
            options: StreamOptions::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Open one upstream generation request for the conversation history plus
    /// the new prompt, and relay its tokens. Fails fast (before any frame)
    /// only if the conversation does not exist.
    pub fn stream_reply(
        &self,
        conversation_id: ConversationId,
        prompt: String,
    ) -> Result<ReplyStream, StoreError> {
        let mut turns = self.conversations.history_as_turns(&conversation_id)?;
        turns.push(ChatTurn::user(prompt));

        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let provider = Arc::clone(&self.provider);
        let conversations = Arc::clone(&self.conversations);
        let options = self.options.clone();
        let metrics = self.metrics.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let completed =
                relay(provider, &turns, &options, &conversations, &conversation_id, tx).await;

            if let Some(metrics) = metrics {
                let name = if completed { "streams.completed" } else { "streams.failed" };
                metrics.counter_inc(name, &[], 1);
                metrics.histogram_observe(
                    "stream.duration_ms",
                    &[],
                    started.elapsed().as_millis() as f64,
                );
            }
        });

        Ok(ReplyStream { frames: rx, task })
    }
}

/// Drive one upstream stream to completion. Returns true when the reply
/// finished and was handed to persistence.
async fn relay(
    provider: Arc<dyn GenerationProvider>,
    turns: &[ChatTurn],
    options: &StreamOptions,
    conversations: &ConversationRepo,
    conversation_id: &ConversationId,
    tx: mpsc::Sender<String>,
) -> bool {
    let mut upstream = match provider.stream_completion(turns, options).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "generation request failed to open"
            );
            let _ = tx.send(ERROR_SENTINEL.to_string()).await;
            return false;
        }
    };

    // Once the requester goes away we stop forwarding but keep draining the
    // upstream, which cannot be cancelled mid-flight. A send into a closed
    // channel is an Err, never a panic.
    let mut client_gone = false;

    while let Some(event) = upstream.next().await {
        match event {
            TokenEvent::Start => {}
            TokenEvent::Delta { delta } => {
                if !client_gone && tx.send(delta).await.is_err() {
                    client_gone = true;
                    tracing::debug!(conversation_id = %conversation_id, "client left mid-stream");
                }
            }
            TokenEvent::Done { text } => {
                if !client_gone {
                    let _ = tx.send(END_SENTINEL.to_string()).await;
                }
                persist_reply(conversations, conversation_id, &text);
                return true;
            }
            TokenEvent::Error { error } => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "generation stream failed; partial reply discarded"
                );
                if !client_gone {
                    let _ = tx.send(ERROR_SENTINEL.to_string()).await;
                }
                return false;
            }
        }
    }

    // Upstream ended without a terminal event — treat as a failure.
    tracing::warn!(conversation_id = %conversation_id, "generation stream ended without terminal event");
    if !client_gone {
        let _ = tx.send(ERROR_SENTINEL.to_string()).await;
    }
    false
}

/// Persist the completed assistant turn. The client already has the full
/// text, so a store failure is retried once and then escalated to an error
/// log rather than surfaced on the wire.
fn persist_reply(conversations: &ConversationRepo, conversation_id: &ConversationId, text: &str) {
    if let Err(first) = conversations.append_message(conversation_id, ChatRole::Assistant, text) {
        tracing::warn!(
            conversation_id = %conversation_id,
            error = %first,
            "assistant reply persist failed, retrying"
        );
        if let Err(second) = conversations.append_message(conversation_id, ChatRole::Assistant, text)
        {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %second,
                "assistant reply lost: persistence failed after retry"
            );
        }
    }
}

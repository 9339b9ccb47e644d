use serde::Deserialize;

use linkup_core::stream::TokenEvent;

/// Sentinel the chat-completions API sends after the final chunk.
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental parser for OpenAI-style chat-completion chunks.
///
/// Feed it the payload of each `data:` frame; it yields `TokenEvent`s and
/// accumulates the full text so `Done` carries the complete reply.
pub struct ChunkParser {
    accumulated: String,
    finished: bool,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            accumulated: String::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse one `data:` payload and return zero or more TokenEvents.
    pub fn parse_data(&mut self, data: &str) -> Vec<TokenEvent> {
        if self.finished {
            return Vec::new();
        }

        if data.trim() == DONE_SENTINEL {
            self.finished = true;
            return vec![TokenEvent::Done {
                text: self.accumulated.clone(),
            }];
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return Vec::new(), // unknown frame shapes are skipped
        };

        let Some(choice) = chunk.choices.first() else {
            return Vec::new();
        };

        match choice.delta.content.as_deref() {
            Some(token) if !token.is_empty() => {
                self.accumulated.push_str(token);
                vec![TokenEvent::Delta {
                    delta: token.to_string(),
                }]
            }
            // finish_reason chunks carry an empty delta; Done waits for [DONE]
            _ => Vec::new(),
        }
    }
}

/// Split raw SSE text into `data:` payloads.
pub fn parse_sse_data(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(|data| data.trim_start().to_string())
        .filter(|data| !data.is_empty())
        .collect()
}

// --- Deserialization types for chat-completion chunks ---

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

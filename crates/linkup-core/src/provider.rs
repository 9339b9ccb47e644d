use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::GatewayError;
use crate::messages::ChatTurn;
use crate::stream::TokenEvent;

/// Options controlling generation behavior.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Trait implemented by each generation backend.
///
/// `stream_completion` opens a single upstream request for the given prompt
/// history and returns a finite, non-restartable token stream.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream_completion(
        &self,
        turns: &[ChatTurn],
        options: &StreamOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = TokenEvent> + Send>>, GatewayError>;
}

//! Language-model backed specialist handlers.

use std::future::Future;
use std::pin::Pin;

use async_openai::types::CreateChatCompletionRequestArgs;
use tower::{BoxError, Service, ServiceExt};
use tracing::debug;

use crate::provider::ModelSvc;
use crate::registry::{HandlerReply, HandlerRequest};

/// A handler that answers by sending the rendered context to a chat model
/// under a fixed system prompt.
#[derive(Clone)]
pub struct LlmHandler {
    model: String,
    system_prompt: String,
    confidence: f32,
    provider: ModelSvc,
}

impl LlmHandler {
    pub fn new(provider: ModelSvc, model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            confidence: 0.8,
            provider,
        }
    }

    /// Confidence reported with every successful answer.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

impl Service<HandlerRequest> for LlmHandler {
    type Response = HandlerReply;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HandlerRequest) -> Self::Future {
        let provider = self.provider.clone();
        let model = self.model.clone();
        let system_prompt = self.system_prompt.clone();
        let confidence = self.confidence;
        Box::pin(async move {
            let messages = req.payload.to_messages(&system_prompt)?;
            let chat = CreateChatCompletionRequestArgs::default()
                .model(model)
                .messages(messages)
                .build()?;
            debug!(handler = %req.handler_id, "invoking language model handler");
            let reply = provider.oneshot(chat).await?;
            match reply.content.filter(|c| !c.trim().is_empty()) {
                Some(text) => Ok(HandlerReply::text(text, confidence)),
                None => Ok(HandlerReply::error("model returned an empty answer")),
            }
        })
    }
}

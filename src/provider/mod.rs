//! Model provider abstraction
//!
//! What this module provides
//! - An interface for chat-completion providers decoupled from the components that use them
//!   (language-model handlers, the hybrid scorer, the delegation framework)
//!
//! Exports
//! - Models
//!   - `ModelReply { content, tool_calls, prompt_tokens, completion_tokens }`
//! - Services
//!   - `ModelService: Service<CreateChatCompletionRequest, Response=ModelReply, Error=BoxError>`
//!   - Implementations: `OpenAIProvider`, `FixedProvider`, `ScriptedProvider`
//!
//! Testing strategy
//! - Swap in `FixedProvider`/`ScriptedProvider` so routing logic is exercised without network

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_openai::{config::OpenAIConfig, types::CreateChatCompletionRequest, Client};
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};
use tracing::{debug, trace};

/// A tool call chosen by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model
    pub arguments: String,
}

/// Provider-neutral view of the first choice of a completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ModelToolCall {
                id: "call_0".to_string(),
                name: name.into(),
                arguments: arguments.to_string(),
            }],
            ..Default::default()
        }
    }
}

/// Model service trait alias.
pub trait ModelService:
    Service<CreateChatCompletionRequest, Response = ModelReply, Error = BoxError>
{
}
impl<T> ModelService for T where
    T: Service<CreateChatCompletionRequest, Response = ModelReply, Error = BoxError>
{
}

/// Boxed model service type alias.
pub type ModelSvc = BoxCloneSyncService<CreateChatCompletionRequest, ModelReply, BoxError>;

/// Chat-completions provider backed by `async-openai`.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Arc<Client<OpenAIConfig>>,
}

impl OpenAIProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self { client }
    }

    /// Client configured from `OPENAI_API_KEY`.
    pub fn from_env() -> Self {
        Self::new(Arc::new(Client::new()))
    }
}

impl Service<CreateChatCompletionRequest> for OpenAIProvider {
    type Response = ModelReply;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            debug!(model = %req.model, messages = req.messages.len(), "chat completion");
            let resp = client.chat().create(req).await?;
            let (prompt_tokens, completion_tokens) = resp
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));
            let choice = resp
                .choices
                .into_iter()
                .next()
                .ok_or("provider returned no choices")?;
            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ModelToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect::<Vec<_>>();
            trace!(tool_calls = tool_calls.len(), "completion received");
            Ok(ModelReply {
                content: choice.message.content,
                tool_calls,
                prompt_tokens,
                completion_tokens,
            })
        })
    }
}

/// A provider that always returns the same reply.
#[derive(Clone)]
pub struct FixedProvider {
    reply: ModelReply,
}

impl FixedProvider {
    pub fn new(reply: ModelReply) -> Self {
        Self { reply }
    }
}

impl Service<CreateChatCompletionRequest> for FixedProvider {
    type Response = ModelReply;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: CreateChatCompletionRequest) -> Self::Future {
        let reply = self.reply.clone();
        Box::pin(async move { Ok(reply) })
    }
}

/// A provider that pops scripted replies in order and errors once exhausted.
/// Every call's request is kept for inspection.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    replies: Arc<Mutex<VecDeque<ModelReply>>>,
    seen: Arc<Mutex<Vec<CreateChatCompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            seen: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<CreateChatCompletionRequest> {
        self.seen.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Service<CreateChatCompletionRequest> for ScriptedProvider {
    type Response = ModelReply;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        Box::pin(async move { next.ok_or_else(|| "scripted provider exhausted".into()) })
    }
}

//! Delegated strategy: an external delegation framework picks the handler.
//!
//! The framework's answer is untrusted. It is checked against the candidates it
//! was offered (plus the default handler) before it can become a proposal. Any
//! other id, including handlers reserved for attachment overrides, is a strategy
//! failure, which the executor turns into a fallback.

use std::future::Future;
use std::pin::Pin;

use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
    CreateChatCompletionRequestArgs, FunctionObjectArgs,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, instrument};

use super::{candidate_infos, CandidateInfo, Proposal, StrategyRequest};
use crate::error::RouterError;
use crate::provider::ModelSvc;
use crate::registry::AgentRegistry;

pub const STRATEGY_NAME: &str = "delegated";
const TRANSFER_PREFIX: &str = "transfer_to_";

#[derive(Debug, Clone, Serialize)]
pub struct DelegationRequest {
    pub message: String,
    pub candidates: Vec<CandidateInfo>,
}

/// Raw answer from the delegation framework.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationReply {
    pub handler_id: String,
    /// The framework's own explanation, if it gave one
    pub text: String,
    pub confidence: Option<f32>,
}

/// A delegation answer after checking it against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegatedChoice {
    Known(String),
    Unknown(String),
}

impl DelegatedChoice {
    pub fn validate(raw: &str, registry: &AgentRegistry) -> Self {
        let id = raw.trim();
        let id = id.strip_prefix(TRANSFER_PREFIX).unwrap_or(id);
        let offered = id == registry.default_id() || registry.candidates().any(|a| a.id == id);
        if offered {
            DelegatedChoice::Known(id.to_string())
        } else {
            DelegatedChoice::Unknown(raw.to_string())
        }
    }
}

/// Delegation framework service trait alias.
pub trait Delegator: Service<DelegationRequest, Response = DelegationReply, Error = BoxError> {}
impl<T> Delegator for T where T: Service<DelegationRequest, Response = DelegationReply, Error = BoxError> {}

/// Boxed delegator service type alias.
pub type DelegatorSvc = BoxCloneSyncService<DelegationRequest, DelegationReply, BoxError>;

#[derive(Clone)]
pub struct DelegatedStrategy {
    delegator: DelegatorSvc,
    /// Used when the framework does not report a confidence of its own
    default_confidence: f32,
}

impl DelegatedStrategy {
    pub fn new(delegator: DelegatorSvc, default_confidence: f32) -> Self {
        Self {
            delegator,
            default_confidence,
        }
    }
}

impl Service<StrategyRequest> for DelegatedStrategy {
    type Response = Proposal;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StrategyRequest) -> Self::Future {
        let delegator = self.delegator.clone();
        let default_confidence = self.default_confidence;
        Box::pin(async move {
            let registry = req.registry;
            let reply = delegator
                .oneshot(DelegationRequest {
                    message: req.request.message().to_string(),
                    candidates: candidate_infos(&registry),
                })
                .await?;
            match DelegatedChoice::validate(&reply.handler_id, &registry) {
                DelegatedChoice::Known(id) => {
                    let explanation = if reply.text.trim().is_empty() {
                        "no reason given".to_string()
                    } else {
                        reply.text.trim().to_string()
                    };
                    Ok(Proposal::new(
                        id.clone(),
                        reply.confidence.unwrap_or(default_confidence),
                        format!("delegated to '{id}': {explanation}"),
                        STRATEGY_NAME,
                    ))
                }
                DelegatedChoice::Unknown(raw) => Err(Box::new(RouterError::strategy(format!(
                    "delegation chose unregistered handler '{raw}'"
                ))) as BoxError),
            }
        })
    }
}

/// Arguments of a `transfer_to_<id>` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TransferArgs {
    /// Why this specialist fits the message
    pub reason: String,
}

/// Delegation framework backed by a chat model that is offered one
/// `transfer_to_<id>` tool per candidate and must call exactly one.
#[derive(Clone)]
pub struct LlmDelegator {
    provider: ModelSvc,
    model: String,
}

impl LlmDelegator {
    pub fn new(provider: ModelSvc, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn transfer_tools(candidates: &[CandidateInfo]) -> Result<Vec<ChatCompletionTool>, BoxError> {
        let schema = serde_json::to_value(schemars::schema_for!(TransferArgs))?;
        candidates
            .iter()
            .map(|c| -> Result<ChatCompletionTool, BoxError> {
                let description = if c.tags.is_empty() {
                    format!("Transfer to {}", c.label)
                } else {
                    format!("Transfer to {} (handles: {})", c.label, c.tags.join(", "))
                };
                let tool = ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(
                        FunctionObjectArgs::default()
                            .name(format!("{TRANSFER_PREFIX}{}", c.id))
                            .description(description)
                            .parameters(schema.clone())
                            .build()?,
                    )
                    .build()?;
                debug!(tool = %tool.function.name, "transfer tool");
                Ok(tool)
            })
            .collect()
    }
}

const DELEGATOR_PROMPT: &str = "You are the triage desk of a household assistant. \
Pick the single specialist best suited to the user's message by calling its transfer tool.";

impl Service<DelegationRequest> for LlmDelegator {
    type Response = DelegationReply;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DelegationRequest) -> Self::Future {
        let provider = self.provider.clone();
        let model = self.model.clone();
        Box::pin(async move {
            let tools = Self::transfer_tools(&req.candidates)?;
            let chat = CreateChatCompletionRequestArgs::default()
                .model(model)
                .messages(vec![
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(DELEGATOR_PROMPT)
                        .build()?
                        .into(),
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(req.message)
                        .build()?
                        .into(),
                ])
                .tools(tools)
                .build()?;
            let reply = provider.oneshot(chat).await?;
            let call = reply
                .tool_calls
                .into_iter()
                .find(|c| c.name.starts_with(TRANSFER_PREFIX))
                .ok_or("delegation model made no transfer")?;
            let reason = serde_json::from_str::<TransferArgs>(&call.arguments)
                .map(|a| a.reason)
                .unwrap_or_default();
            Ok(DelegationReply {
                handler_id: call.name[TRANSFER_PREFIX.len()..].to_string(),
                text: if reason.is_empty() {
                    reply.content.unwrap_or_default()
                } else {
                    reason
                },
                confidence: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FixedProvider, ModelReply, ScriptedProvider};
    use crate::strategy::test_support::{registry, strategy_request};
    use serde_json::json;
    use tower::service_fn;

    fn delegator(id: &'static str, confidence: Option<f32>) -> DelegatorSvc {
        BoxCloneSyncService::new(service_fn(move |_req: DelegationRequest| async move {
            Ok::<_, BoxError>(DelegationReply {
                handler_id: id.to_string(),
                text: "sounds medical".to_string(),
                confidence,
            })
        }))
    }

    #[test]
    fn validate_tags_untrusted_ids() {
        let reg = registry();
        assert_eq!(
            DelegatedChoice::validate(" health ", &reg),
            DelegatedChoice::Known("health".into())
        );
        assert_eq!(
            DelegatedChoice::validate("transfer_to_schedule", &reg),
            DelegatedChoice::Known("schedule".into())
        );
        assert_eq!(
            DelegatedChoice::validate("astrology", &reg),
            DelegatedChoice::Unknown("astrology".into())
        );
        assert_eq!(
            DelegatedChoice::validate("general", &reg),
            DelegatedChoice::Known("general".into())
        );
    }

    #[tokio::test]
    async fn override_handlers_are_not_delegation_targets() {
        for reserved in ["image_handler", "transfer_to_voice_handler"] {
            assert_eq!(
                DelegatedChoice::validate(reserved, &registry()),
                DelegatedChoice::Unknown(reserved.into())
            );
        }
        let err = DelegatedStrategy::new(delegator("image_handler", None), 0.8)
            .oneshot(strategy_request("look at this"))
            .await
            .unwrap_err();
        assert!(matches!(
            RouterError::from_boxed(err),
            RouterError::Strategy { .. }
        ));
    }

    #[tokio::test]
    async fn known_choice_becomes_proposal() {
        let p = DelegatedStrategy::new(delegator("health", None), 0.8)
            .oneshot(strategy_request("anything"))
            .await
            .unwrap();
        assert_eq!(p.handler_id, "health");
        assert_eq!(p.confidence, 0.8);
        assert!(p.rationale.contains("sounds medical"));

        let p = DelegatedStrategy::new(delegator("health", Some(0.35)), 0.8)
            .oneshot(strategy_request("anything"))
            .await
            .unwrap();
        assert_eq!(p.confidence, 0.35);
    }

    #[tokio::test]
    async fn unknown_choice_is_a_strategy_error() {
        let err = DelegatedStrategy::new(delegator("astrology", None), 0.8)
            .oneshot(strategy_request("anything"))
            .await
            .unwrap_err();
        assert!(matches!(
            RouterError::from_boxed(err),
            RouterError::Strategy { .. }
        ));
    }

    #[tokio::test]
    async fn llm_delegator_reads_transfer_call() {
        let provider = ScriptedProvider::new(vec![ModelReply::tool_call(
            "transfer_to_nutrition",
            json!({"reason": "asks about dinner"}),
        )]);
        let reply = LlmDelegator::new(BoxCloneSyncService::new(provider.clone()), "gpt-4o-mini")
            .oneshot(DelegationRequest {
                message: "what's for dinner".into(),
                candidates: candidate_infos(&registry()),
            })
            .await
            .unwrap();
        assert_eq!(reply.handler_id, "nutrition");
        assert_eq!(reply.text, "asks about dinner");

        let sent = provider.requests();
        let tools = sent[0].tools.as_ref().unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["transfer_to_health", "transfer_to_nutrition", "transfer_to_schedule"]
        );
        let params = tools[0].function.parameters.as_ref().unwrap();
        assert!(params["properties"].get("reason").is_some());
    }

    #[tokio::test]
    async fn llm_delegator_without_transfer_errors() {
        let provider = FixedProvider::new(ModelReply::text("I'm not sure"));
        let err = LlmDelegator::new(BoxCloneSyncService::new(provider), "gpt-4o-mini")
            .oneshot(DelegationRequest {
                message: "hmm".into(),
                candidates: vec![],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no transfer"));
    }
}

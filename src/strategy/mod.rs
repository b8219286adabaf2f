//! Routing strategies
//!
//! What this module provides
//! - Pluggable algorithms proposing which handler should serve a request
//!
//! Exports
//! - Models
//!   - `StrategyRequest { request, registry }`
//!   - `Proposal { handler_id, confidence, rationale, strategy }`
//! - Services
//!   - `RoutingStrategy: Service<StrategyRequest, Response=Proposal>`
//!   - Implementations: `KeywordStrategy`, `HybridStrategy`, `DelegatedStrategy`
//!
//! Contract
//! - A well-formed request never makes a strategy error out on mere uncertainty: it
//!   proposes the default handler with confidence 0 and says why
//! - Errors are reserved for real failures (a collaborator erroring, an untrusted
//!   answer naming an unregistered handler); the executor recovers from them

use std::sync::Arc;

use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};

use crate::model::{clamp_confidence, RoutingDecision, RoutingRequest};
use crate::registry::AgentRegistry;

pub mod delegated;
pub mod hybrid;
pub mod keyword;

pub use delegated::{DelegatedChoice, DelegatedStrategy, DelegationReply, DelegationRequest, LlmDelegator};
pub use hybrid::{HandlerScore, HybridStrategy, LlmScorer, ScoreRequest};
pub use keyword::{KeywordScore, KeywordStrategy};

/// Input to a strategy: the request plus the registry to choose from.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub request: Arc<RoutingRequest>,
    pub registry: Arc<AgentRegistry>,
}

/// A strategy's proposal. Not yet trusted: the executor checks it against the
/// registry and the confidence floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub handler_id: String,
    pub confidence: f32,
    pub rationale: String,
    pub strategy: String,
}

impl Proposal {
    pub fn new(
        handler_id: impl Into<String>,
        confidence: f32,
        rationale: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            confidence: clamp_confidence(confidence),
            rationale: rationale.into(),
            strategy: strategy.into(),
        }
    }

    /// The "no idea" answer: default handler, zero confidence.
    pub fn uncertain(
        registry: &AgentRegistry,
        strategy: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self::new(registry.default_id(), 0.0, rationale, strategy)
    }

    pub fn into_decision(self) -> RoutingDecision {
        RoutingDecision::new(self.handler_id, self.confidence, self.rationale, self.strategy)
    }
}

/// Strategy service trait alias.
pub trait RoutingStrategy: Service<StrategyRequest, Response = Proposal, Error = BoxError> {}
impl<T> RoutingStrategy for T where T: Service<StrategyRequest, Response = Proposal, Error = BoxError> {}

/// Boxed strategy service type alias.
pub type StrategySvc = BoxCloneSyncService<StrategyRequest, Proposal, BoxError>;

/// What an external scorer or delegation framework is told about a candidate.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CandidateInfo {
    pub id: String,
    pub label: String,
    pub tags: Vec<String>,
}

pub(crate) fn candidate_infos(registry: &AgentRegistry) -> Vec<CandidateInfo> {
    registry
        .candidates()
        .map(|a| CandidateInfo {
            id: a.id.clone(),
            label: a.label.clone(),
            tags: a.tags.iter().cloned().collect(),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::registry::test_support::echo;
    use crate::registry::{AgentDescriptor, ConfidenceClass};

    /// general (default), image/voice (reserved), health, nutrition, schedule.
    pub fn registry() -> Arc<AgentRegistry> {
        Arc::new(
            AgentRegistry::builder()
                .agent(AgentDescriptor::new("general", "General", echo("general")))
                .agent(
                    AgentDescriptor::new("image_handler", "Images", echo("image"))
                        .with_tags(["photo", "picture"]),
                )
                .agent(AgentDescriptor::new("voice_handler", "Voice", echo("voice")))
                .agent(
                    AgentDescriptor::new("health", "Health", echo("health"))
                        .with_tags(["fever", "doctor", "cough"])
                        .with_class(ConfidenceClass::High),
                )
                .agent(
                    AgentDescriptor::new("nutrition", "Nutrition", echo("nutrition"))
                        .with_tags(["recipe", "cook", "dinner"]),
                )
                .agent(
                    AgentDescriptor::new("schedule", "Schedule", echo("schedule"))
                        .with_tags(["calendar", "appointment", "doctor"])
                        .with_class(ConfidenceClass::Low),
                )
                .default_handler("general")
                .reserve("image_handler")
                .reserve("voice_handler")
                .build()
                .unwrap(),
        )
    }

    pub fn strategy_request(message: &str) -> StrategyRequest {
        StrategyRequest {
            request: Arc::new(
                RoutingRequest::builder("u1", "s1")
                    .message(message)
                    .build()
                    .unwrap(),
            ),
            registry: registry(),
        }
    }
}

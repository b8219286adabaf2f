//! Routing executor
//!
//! Drives one request through
//! `received → override-checked → strategy-consulted → decided → invoked →
//! (confirmation-pending | completed) → terminal`, emitting a trace event on every
//! transition.
//!
//! Recovery rules:
//! - an attachment override decides outright and skips the strategy
//! - a proposal below the confidence floor, naming an unregistered handler, or a
//!   strategy that errors or misses its deadline all retarget to the default handler
//! - a failed handler gets exactly one fallback invocation on the default handler;
//!   if that fails too the caller receives an apology with `success = false`

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tower::{BoxError, ServiceExt};
use tracing::{debug, info, warn};

use crate::confirmation::{Binding, ConfirmationGate, ConfirmationOutcome, ResolvedConfirmation};
use crate::context::{ContextBuilder, ContextPayload};
use crate::error::{Result, RouterError};
use crate::model::{
    AgentResponse, FallbackReason, ResponseBody, RouteResponse, RoutingDecision, RoutingRequest,
};
use crate::overrides::AttachmentOverride;
use crate::registry::{AgentRegistry, HandlerRequest};
use crate::resilience::{guard_handler, DeadlineElapsed};
use crate::strategy::{StrategyRequest, StrategySvc};

/// Answer given when neither the chosen handler nor the fallback could answer.
pub const APOLOGY: &str =
    "Sorry, I couldn't help with that right now. Please try again in a moment.";
/// Acknowledgement for a declined confirmation.
pub const DECLINED: &str = "Okay, I won't go ahead with that.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Received,
    OverrideChecked,
    StrategyConsulted,
    Decided,
    Invoked,
    ConfirmationPending,
    Completed,
    Terminal,
}

fn transition(state: RouteState, handler: Option<&str>) {
    debug!(state = ?state, handler = handler.unwrap_or("-"), "route transition");
}

/// Runs single handler invocations under the shared ceiling and the per-call deadline.
#[derive(Clone)]
pub struct Invoker {
    registry: Arc<AgentRegistry>,
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl Invoker {
    pub fn new(registry: Arc<AgentRegistry>, permits: Arc<Semaphore>, deadline: Duration) -> Self {
        Self {
            registry,
            permits,
            deadline,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Never errors: every failure mode becomes a failed [`AgentResponse`].
    pub async fn invoke(&self, handler_id: &str, payload: ContextPayload) -> AgentResponse {
        let started = Instant::now();
        let Some(agent) = self.registry.get(handler_id) else {
            return AgentResponse::failed(handler_id, "handler is not registered", Duration::ZERO);
        };
        let svc = guard_handler(agent.handler(), self.permits.clone(), self.deadline);
        let result = svc
            .oneshot(HandlerRequest {
                handler_id: handler_id.to_string(),
                payload,
            })
            .await;
        let elapsed = started.elapsed();
        match result {
            Ok(reply) => match reply.error {
                Some(error) => {
                    warn!(handler = handler_id, %error, "handler reported failure");
                    AgentResponse::failed(handler_id, error, elapsed)
                }
                None if reply.text.trim().is_empty() => {
                    warn!(handler = handler_id, "handler returned an empty answer");
                    AgentResponse::failed(handler_id, "handler returned an empty answer", elapsed)
                }
                None => AgentResponse::succeeded(handler_id, reply.text, reply.confidence, elapsed),
            },
            Err(e) => {
                if e.is::<DeadlineElapsed>() {
                    warn!(handler = handler_id, ms = elapsed.as_millis() as u64, "handler timed out");
                } else {
                    warn!(handler = handler_id, error = %e, "handler errored");
                }
                AgentResponse::failed(handler_id, e.to_string(), elapsed)
            }
        }
    }
}

#[derive(Clone)]
pub struct RoutingExecutor {
    invoker: Invoker,
    strategy: StrategySvc,
    strategy_name: String,
    strategy_deadline: Duration,
    overrides: AttachmentOverride,
    context: ContextBuilder,
    gate: ConfirmationGate,
    confidence_floor: f32,
}

impl RoutingExecutor {
    pub fn new(
        invoker: Invoker,
        strategy: StrategySvc,
        strategy_name: impl Into<String>,
        strategy_deadline: Duration,
        overrides: AttachmentOverride,
        context: ContextBuilder,
        gate: ConfirmationGate,
        confidence_floor: f32,
    ) -> Self {
        Self {
            invoker,
            strategy,
            strategy_name: strategy_name.into(),
            strategy_deadline,
            overrides,
            context,
            gate,
            confidence_floor,
        }
    }

    fn registry(&self) -> &Arc<AgentRegistry> {
        self.invoker.registry()
    }

    /// Override check, strategy consultation and floor check. Never fails.
    pub async fn decide(&self, request: &Arc<RoutingRequest>) -> RoutingDecision {
        transition(RouteState::Received, None);
        if let Some(decision) = self.overrides.apply(request) {
            transition(RouteState::OverrideChecked, Some(&decision.handler_id));
            return decision;
        }
        transition(RouteState::OverrideChecked, None);

        let registry = self.registry().clone();
        let default_id = registry.default_id().to_string();
        let consult = self.strategy.clone().oneshot(StrategyRequest {
            request: request.clone(),
            registry: registry.clone(),
        });
        let proposal = timeout(self.strategy_deadline, consult)
            .await
            .unwrap_or_else(|_| {
                Err(Box::new(RouterError::strategy(format!(
                    "no proposal within {}ms",
                    self.strategy_deadline.as_millis()
                ))) as BoxError)
            });
        transition(RouteState::StrategyConsulted, None);

        match proposal {
            Err(e) => {
                let error = RouterError::from_boxed(e).to_string();
                warn!(strategy = %self.strategy_name, %error, "strategy failed");
                RoutingDecision::new(
                    &default_id,
                    0.0,
                    format!("strategy '{}' produced no usable proposal", self.strategy_name),
                    &self.strategy_name,
                )
                .fall_back(&default_id, FallbackReason::StrategyFailed { error })
            }
            Ok(p) => {
                let decision = p.into_decision();
                if !registry.contains(&decision.handler_id) {
                    let handler_id = decision.handler_id.clone();
                    info!(handler = %handler_id, "proposal names an unregistered handler");
                    decision.fall_back(&default_id, FallbackReason::UnknownHandler { handler_id })
                } else if decision.confidence < self.confidence_floor {
                    info!(
                        handler = %decision.handler_id,
                        confidence = decision.confidence,
                        floor = self.confidence_floor,
                        "confidence below floor"
                    );
                    let reason = FallbackReason::LowConfidence {
                        confidence: decision.confidence,
                        floor: self.confidence_floor,
                    };
                    decision.fall_back(&default_id, reason)
                } else {
                    decision
                }
            }
        }
    }

    /// Full single-handler flow for `request`.
    pub async fn execute(&self, request: Arc<RoutingRequest>) -> Result<RouteResponse> {
        let decision = self.decide(&request).await;
        transition(RouteState::Decided, Some(&decision.handler_id));
        let payload = self.context.build(&request);
        self.run(decision, payload, request.user_id(), request.session_id())
            .await
    }

    /// Resumes a resolved confirmation.
    pub async fn follow_up(
        &self,
        resolved: ResolvedConfirmation,
        user_response: &str,
    ) -> Result<RouteResponse> {
        let pending = resolved.pending;
        match resolved.outcome {
            ConfirmationOutcome::Rejected => {
                let decision = RoutingDecision::new(
                    &pending.origin_handler,
                    1.0,
                    format!("user declined confirmation {}", pending.envelope.id),
                    "confirmation",
                );
                transition(RouteState::Terminal, Some(&pending.origin_handler));
                Ok(RouteResponse::answer(
                    decision,
                    AgentResponse::succeeded(&pending.origin_handler, DECLINED, 1.0, Duration::ZERO),
                ))
            }
            ConfirmationOutcome::Accepted { option } => {
                let mut decision = RoutingDecision::new(
                    &pending.follow_up_handler,
                    1.0,
                    format!(
                        "user chose '{option}' for confirmation {}",
                        pending.envelope.id
                    ),
                    "confirmation",
                );
                let registry = self.registry();
                if !registry.contains(&decision.handler_id) {
                    let handler_id = decision.handler_id.clone();
                    decision = decision.fall_back(
                        registry.default_id(),
                        FallbackReason::UnknownHandler { handler_id },
                    );
                }
                transition(RouteState::Decided, Some(&decision.handler_id));
                let payload = self.context.follow_up(
                    &pending.envelope,
                    &pending.user_id,
                    &pending.session_id,
                    user_response,
                );
                self.run(decision, payload, &pending.user_id, &pending.session_id)
                    .await
            }
        }
    }

    /// Invocation with at most one fallback, then the confirmation gate.
    async fn run(
        &self,
        decision: RoutingDecision,
        payload: ContextPayload,
        user_id: &str,
        session_id: &str,
    ) -> Result<RouteResponse> {
        let default_id = self.registry().default_id().to_string();

        let mut decision = decision;
        let mut response = self.invoker.invoke(&decision.handler_id, payload.clone()).await;
        transition(RouteState::Invoked, Some(&decision.handler_id));

        if !response.success && decision.fallback.is_none() && decision.handler_id != default_id {
            let reason = FallbackReason::HandlerFailed {
                handler_id: decision.handler_id.clone(),
                error: response.error.clone().unwrap_or_default(),
            };
            info!(from = %decision.handler_id, to = %default_id, "falling back after handler failure");
            decision = decision.fall_back(&default_id, reason);
            response = self.invoker.invoke(&default_id, payload).await;
            transition(RouteState::Invoked, Some(&decision.handler_id));
        }

        if !response.success {
            warn!(handler = %decision.handler_id, "no handler could answer; apologising");
            let apology = AgentResponse {
                text: APOLOGY.to_string(),
                ..response
            };
            transition(RouteState::Terminal, Some(&decision.handler_id));
            return Ok(RouteResponse {
                success: false,
                text: APOLOGY.to_string(),
                body: ResponseBody::Answer {
                    decision,
                    response: apology,
                },
            });
        }

        if let Some(marker) = self.gate.inspect(&response.text) {
            let envelope = self
                .gate
                .suspend(
                    &marker,
                    Binding {
                        session_id,
                        user_id,
                        handler_id: &decision.handler_id,
                    },
                )
                .await?;
            transition(RouteState::ConfirmationPending, Some(&decision.handler_id));
            return Ok(RouteResponse::confirmation(decision, envelope));
        }

        transition(RouteState::Completed, Some(&decision.handler_id));
        transition(RouteState::Terminal, Some(&decision.handler_id));
        Ok(RouteResponse::answer(decision, response))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::confirmation::InMemoryConfirmationStore;
    use crate::registry::{AgentDescriptor, HandlerReply, HandlerSvc};
    use crate::strategy::KeywordStrategy;
    use tower::service_fn;
    use tower::util::BoxCloneSyncService;

    pub fn failing(message: &'static str) -> HandlerSvc {
        BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| async move {
            Err::<HandlerReply, BoxError>(message.into())
        }))
    }

    pub fn replying(text: &'static str) -> HandlerSvc {
        BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| async move {
            Ok::<_, BoxError>(HandlerReply::text(text, 0.8))
        }))
    }

    pub fn executor_with(
        agents: Vec<AgentDescriptor>,
        strategy: StrategySvc,
        floor: f32,
    ) -> RoutingExecutor {
        let mut builder = AgentRegistry::builder();
        for a in agents {
            builder = builder.agent(a);
        }
        let registry = Arc::new(
            builder
                .default_handler("general")
                .reserve("image_handler")
                .reserve("voice_handler")
                .build()
                .unwrap(),
        );
        let invoker = Invoker::new(
            registry,
            Arc::new(Semaphore::new(4)),
            Duration::from_millis(200),
        );
        let gate = ConfirmationGate::new(
            Arc::new(InMemoryConfirmationStore::new()),
            Duration::from_secs(60),
        );
        RoutingExecutor::new(
            invoker,
            strategy,
            "keyword",
            Duration::from_millis(100),
            AttachmentOverride::new("image_handler", "voice_handler"),
            ContextBuilder::default(),
            gate,
            floor,
        )
    }

    pub fn keyword() -> StrategySvc {
        BoxCloneSyncService::new(KeywordStrategy)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::Attachment;
    use crate::registry::AgentDescriptor;
    use crate::strategy::Proposal;
    use tower::service_fn;
    use tower::util::BoxCloneSyncService;

    fn standard_agents() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor::new("general", "General", replying("general answer")),
            AgentDescriptor::new("image_handler", "Images", replying("nice photo")),
            AgentDescriptor::new("voice_handler", "Voice", replying("heard you")),
            AgentDescriptor::new("health", "Health", replying("rest and fluids"))
                .with_tags(["fever", "cough"]),
        ]
    }

    fn request(message: &str) -> Arc<RoutingRequest> {
        Arc::new(
            RoutingRequest::builder("u1", "s1")
                .message(message)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn keyword_match_is_invoked() {
        let exec = executor_with(standard_agents(), keyword(), 0.3);
        let resp = exec.execute(request("she has a fever")).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.text, "rest and fluids");
        let d = resp.decision().unwrap();
        assert_eq!(d.handler_id, "health");
        assert!(d.fallback.is_none());
    }

    #[tokio::test]
    async fn override_skips_strategy() {
        let strategy: StrategySvc = BoxCloneSyncService::new(service_fn(|_r: StrategyRequest| async {
            Ok::<_, BoxError>(Proposal::new("health", 1.0, "always health", "test"))
        }));
        let exec = executor_with(standard_agents(), strategy, 0.3);
        let req = Arc::new(
            RoutingRequest::builder("u1", "s1")
                .message("my fever")
                .attachment(Attachment::image("img-9"))
                .build()
                .unwrap(),
        );
        let resp = exec.execute(req).await.unwrap();
        let d = resp.decision().unwrap();
        assert_eq!(d.handler_id, "image_handler");
        assert_eq!(d.strategy, "override");
        assert_eq!(resp.text, "nice photo");
    }

    #[tokio::test]
    async fn below_floor_falls_back_with_reason() {
        let exec = executor_with(standard_agents(), keyword(), 0.95);
        let resp = exec.execute(request("fever")).await.unwrap();
        let d = resp.decision().unwrap();
        assert_eq!(d.handler_id, "general");
        assert!(matches!(d.fallback, Some(FallbackReason::LowConfidence { .. })));
        assert!(d.rationale.contains("fever"));
        assert_eq!(resp.text, "general answer");
    }

    #[tokio::test]
    async fn strategy_error_and_unknown_id_fall_back() {
        let erroring: StrategySvc = BoxCloneSyncService::new(service_fn(|_r: StrategyRequest| async {
            Err::<Proposal, BoxError>("scorer exploded".into())
        }));
        let exec = executor_with(standard_agents(), erroring, 0.3);
        let resp = exec.execute(request("anything")).await.unwrap();
        let d = resp.decision().unwrap();
        assert_eq!(d.handler_id, "general");
        assert!(matches!(d.fallback, Some(FallbackReason::StrategyFailed { .. })));

        let unknown: StrategySvc = BoxCloneSyncService::new(service_fn(|_r: StrategyRequest| async {
            Ok::<_, BoxError>(Proposal::new("astrology", 0.99, "stars say so", "test"))
        }));
        let exec = executor_with(standard_agents(), unknown, 0.3);
        let resp = exec.execute(request("anything")).await.unwrap();
        assert!(matches!(
            resp.decision().unwrap().fallback,
            Some(FallbackReason::UnknownHandler { .. })
        ));
    }

    #[tokio::test]
    async fn hung_strategy_falls_back_at_its_deadline() {
        let hung: StrategySvc = BoxCloneSyncService::new(service_fn(|_r: StrategyRequest| {
            futures::future::pending::<std::result::Result<Proposal, BoxError>>()
        }));
        let exec = executor_with(standard_agents(), hung, 0.3);
        let resp = tokio::time::timeout(Duration::from_secs(2), exec.execute(request("fever")))
            .await
            .expect("route must finish once the strategy deadline passes")
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.text, "general answer");
        match &resp.decision().unwrap().fallback {
            Some(FallbackReason::StrategyFailed { error }) => assert!(error.contains("100ms")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_failure_gets_one_fallback() {
        let mut agents = standard_agents();
        agents[3] = AgentDescriptor::new("health", "Health", failing("db down")).with_tags(["fever"]);
        let exec = executor_with(agents, keyword(), 0.3);
        let resp = exec.execute(request("fever")).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.text, "general answer");
        match resp.decision().unwrap().fallback.as_ref().unwrap() {
            FallbackReason::HandlerFailed { handler_id, error } => {
                assert_eq!(handler_id, "health");
                assert!(error.contains("db down"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_fallback_apologises() {
        let agents = vec![
            AgentDescriptor::new("general", "General", failing("general down")),
            AgentDescriptor::new("image_handler", "Images", replying("x")),
            AgentDescriptor::new("voice_handler", "Voice", replying("x")),
            AgentDescriptor::new("health", "Health", failing("health down")).with_tags(["fever"]),
        ];
        let exec = executor_with(agents, keyword(), 0.3);
        let resp = exec.execute(request("fever")).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.text, APOLOGY);
        match &resp.body {
            ResponseBody::Answer { response, decision } => {
                assert!(!response.success);
                assert!(response.error.is_some());
                assert_eq!(decision.handler_id, "general");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn marker_suspends_the_turn() {
        let mut agents = standard_agents();
        agents[3] = AgentDescriptor::new(
            "health",
            "Health",
            replying(r#"I can book a doctor. {"type":"confirmation_request","question":"Book Dr. Lee at 3pm?"}"#),
        )
        .with_tags(["fever"]);
        let exec = executor_with(agents, keyword(), 0.3);
        let resp = exec.execute(request("fever")).await.unwrap();
        assert!(resp.is_pending_confirmation());
        assert_eq!(resp.text, "Book Dr. Lee at 3pm?");
        assert_eq!(resp.envelope().unwrap().options, vec!["confirm", "cancel"]);
    }
}

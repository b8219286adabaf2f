//! Engine assembly and public entry points
//!
//! What this module provides
//! - `EngineBuilder`: validates configuration, builds the registry once and wires
//!   strategy, overrides, concurrency ceiling, confirmation store and context builder
//! - `RouterEngine`: `route`, `route_parallel`, `resolve_confirmation`, and a
//!   `Service<RoutingRequest>` impl so Tower layers (session context, metrics) wrap it
//!
//! Everything built here is immutable afterwards and shared behind `Arc`s; clones
//! of the engine are cheap and share the global semaphore.
//!
//! ```rust,no_run
//! use tower_agent_router::{RouterConfig, RouterEngine, RoutingRequest};
//! use tower_agent_router::registry::{AgentDescriptor, HandlerReply, HandlerRequest};
//! use tower::{service_fn, BoxError};
//!
//! # async fn demo() -> tower_agent_router::Result<()> {
//! let answer = |text: &'static str| {
//!     service_fn(move |_req: HandlerRequest| async move {
//!         Ok::<_, BoxError>(HandlerReply::text(text, 0.8))
//!     })
//! };
//! let engine = RouterEngine::builder(RouterConfig::default())
//!     .agent(AgentDescriptor::new("general", "General", answer("Happy to help.")))
//!     .agent(AgentDescriptor::new("image_handler", "Images", answer("Nice photo.")))
//!     .agent(AgentDescriptor::new("voice_handler", "Voice", answer("Got your message.")))
//!     .agent(AgentDescriptor::new("nutrition", "Nutrition", answer("Try lentil soup.")).with_tags(["dinner", "recipe"]))
//!     .build()?;
//!
//! let req = RoutingRequest::builder("u1", "s1").message("ideas for dinner?").build()?;
//! let resp = engine.route(req).await?;
//! println!("{}", resp.text);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};
use tracing::{debug, instrument};

use crate::catalog::household_specialists;
use crate::config::RouterConfig;
use crate::confirmation::{ConfirmationGate, InMemoryConfirmationStore, PendingConfirmationStore};
use crate::context::ContextBuilder;
use crate::error::{Result, RouterError, ValidationError};
use crate::executor::{Invoker, RoutingExecutor};
use crate::model::{AgentResponse, ParallelBatchResult, RouteResponse, RoutingRequest};
use crate::overrides::AttachmentOverride;
use crate::parallel::ParallelCoordinator;
use crate::provider::ModelSvc;
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::strategy::delegated::{self, DelegatorSvc};
use crate::strategy::hybrid::{self, ScorerSvc};
use crate::strategy::keyword;
use crate::strategy::{
    DelegatedStrategy, HybridStrategy, KeywordStrategy, Proposal, StrategyRequest, StrategySvc,
};

enum StrategyChoice {
    Keyword,
    Hybrid(ScorerSvc),
    Delegated(DelegatorSvc),
    Custom { name: String, svc: StrategySvc },
}

pub struct EngineBuilder {
    config: RouterConfig,
    agents: Vec<AgentDescriptor>,
    strategy: StrategyChoice,
    confirmations: Option<Arc<dyn PendingConfirmationStore>>,
}

impl EngineBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            agents: Vec::new(),
            strategy: StrategyChoice::Keyword,
            confirmations: None,
        }
    }

    pub fn agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.agents.push(descriptor);
        self
    }

    pub fn agents(mut self, descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        self.agents.extend(descriptors);
        self
    }

    /// Registers every built-in household specialist, answered by `model`.
    pub fn household_catalog(mut self, provider: ModelSvc, model: &str) -> Self {
        self.agents.extend(
            household_specialists()
                .iter()
                .map(|p| p.into_descriptor(provider.clone(), model)),
        );
        self
    }

    /// The default: tag matching only, no collaborators.
    pub fn keyword_strategy(mut self) -> Self {
        self.strategy = StrategyChoice::Keyword;
        self
    }

    /// Keyword scores blended with a model scorer using the configured weights.
    pub fn hybrid_strategy(mut self, scorer: ScorerSvc) -> Self {
        self.strategy = StrategyChoice::Hybrid(scorer);
        self
    }

    /// Lets a delegation framework pick the handler.
    pub fn delegated_strategy(mut self, delegator: DelegatorSvc) -> Self {
        self.strategy = StrategyChoice::Delegated(delegator);
        self
    }

    /// Any other `Service<StrategyRequest, Response = Proposal>`.
    pub fn strategy<S>(mut self, name: impl Into<String>, strategy: S) -> Self
    where
        S: Service<StrategyRequest, Response = Proposal, Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.strategy = StrategyChoice::Custom {
            name: name.into(),
            svc: BoxCloneSyncService::new(strategy),
        };
        self
    }

    /// Pending-confirmation store; in-memory when unset.
    pub fn confirmation_store(mut self, store: Arc<dyn PendingConfirmationStore>) -> Self {
        self.confirmations = Some(store);
        self
    }

    pub fn build(self) -> Result<RouterEngine> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(
            self.agents
                .into_iter()
                .fold(AgentRegistry::builder(), |b, a| b.agent(a))
                .default_handler(config.default_handler.clone())
                .reserve(config.image_handler.clone())
                .reserve(config.voice_handler.clone())
                .build()?,
        );
        let overrides = AttachmentOverride::from_config(&config);
        overrides.validate(&registry)?;

        let (strategy_name, strategy): (String, StrategySvc) = match self.strategy {
            StrategyChoice::Keyword => (
                keyword::STRATEGY_NAME.to_string(),
                BoxCloneSyncService::new(KeywordStrategy),
            ),
            StrategyChoice::Hybrid(scorer) => (
                hybrid::STRATEGY_NAME.to_string(),
                BoxCloneSyncService::new(HybridStrategy::new(scorer, config.hybrid)?),
            ),
            StrategyChoice::Delegated(delegator) => (
                delegated::STRATEGY_NAME.to_string(),
                BoxCloneSyncService::new(DelegatedStrategy::new(
                    delegator,
                    config.delegated_confidence,
                )),
            ),
            StrategyChoice::Custom { name, svc } => {
                if name.trim().is_empty() {
                    return Err(RouterError::config("strategy name must not be empty"));
                }
                (name, svc)
            }
        };

        let store = self
            .confirmations
            .unwrap_or_else(|| Arc::new(InMemoryConfirmationStore::new()));
        let gate = ConfirmationGate::new(store, config.confirmation_ttl());
        let context = ContextBuilder::new(config.context.clone());
        let permits = Arc::new(Semaphore::new(config.global_concurrency));
        let invoker = Invoker::new(registry.clone(), permits, config.handler_timeout());

        let executor = RoutingExecutor::new(
            invoker.clone(),
            strategy,
            strategy_name.clone(),
            config.strategy_timeout(),
            overrides,
            context.clone(),
            gate.clone(),
            config.confidence_floor,
        );
        let parallel = ParallelCoordinator::new(
            invoker.clone(),
            context.clone(),
            config.max_parallel_handlers,
        );

        debug!(
            handlers = registry.len(),
            strategy = %strategy_name,
            default = registry.default_id(),
            "routing engine assembled"
        );
        Ok(RouterEngine {
            inner: Arc::new(EngineInner {
                config,
                registry,
                strategy_name,
                invoker,
                context,
                executor,
                parallel,
                gate,
            }),
        })
    }
}

struct EngineInner {
    config: RouterConfig,
    registry: Arc<AgentRegistry>,
    strategy_name: String,
    invoker: Invoker,
    context: ContextBuilder,
    executor: RoutingExecutor,
    parallel: ParallelCoordinator,
    gate: ConfirmationGate,
}

#[derive(Clone)]
pub struct RouterEngine {
    inner: Arc<EngineInner>,
}

impl RouterEngine {
    pub fn builder(config: RouterConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn strategy_name(&self) -> &str {
        &self.inner.strategy_name
    }

    pub fn confirmations(&self) -> &Arc<dyn PendingConfirmationStore> {
        self.inner.gate.store()
    }

    /// Routes one request. Requests naming targets run as a parallel batch.
    #[instrument(
        name = "route",
        skip_all,
        fields(user_id = %request.user_id(), session_id = %request.session_id())
    )]
    pub async fn route(&self, request: RoutingRequest) -> Result<RouteResponse> {
        if request.is_parallel() {
            return self.run_batch(&request).await.map(RouteResponse::batch);
        }
        self.inner.executor.execute(Arc::new(request)).await
    }

    /// Fans the request out to its targets.
    #[instrument(
        name = "route_parallel",
        skip_all,
        fields(
            user_id = %request.user_id(),
            session_id = %request.session_id(),
            targets = request.targets().len()
        )
    )]
    pub async fn route_parallel(&self, request: RoutingRequest) -> Result<ParallelBatchResult> {
        self.run_batch(&request).await
    }

    async fn run_batch(&self, request: &RoutingRequest) -> Result<ParallelBatchResult> {
        self.inner.parallel.run(request).await
    }

    /// Answers a pending confirmation and runs whatever it unblocks.
    #[instrument(
        name = "resolve_confirmation",
        skip_all,
        fields(confirmation_id = %id, session_id = %session_id)
    )]
    pub async fn resolve_confirmation(
        &self,
        id: &str,
        user_response: &str,
        session_id: &str,
    ) -> Result<RouteResponse> {
        let resolved = self.inner.gate.resolve(id, user_response, session_id).await?;
        self.inner.executor.follow_up(resolved, user_response).await
    }

    /// Invokes `handler_id` directly, bypassing routing but not the handler
    /// deadline or the global ceiling.
    pub async fn invoke(&self, handler_id: &str, request: RoutingRequest) -> Result<AgentResponse> {
        if !self.inner.registry.contains(handler_id) {
            return Err(ValidationError::UnknownHandler {
                handler_id: handler_id.to_string(),
            }
            .into());
        }
        let payload = self.inner.context.build(&request);
        Ok(self.inner.invoker.invoke(handler_id, payload).await)
    }

    /// Discards confirmations that expired before now. Returns how many went.
    pub async fn purge_expired_confirmations(&self) -> Result<usize> {
        self.inner.gate.purge_expired().await
    }
}

impl std::fmt::Debug for RouterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterEngine")
            .field("strategy", &self.inner.strategy_name)
            .field("handlers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Service<RoutingRequest> for RouterEngine {
    type Response = RouteResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RoutingRequest) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move { engine.route(req).await.map_err(Into::into) })
    }
}

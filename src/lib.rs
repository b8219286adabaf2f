//! # Tower agent router
//!
//! Routing and orchestration for a household assistant built from specialist
//! conversational agents. Every moving part is a Tower service, so strategies,
//! handlers, stores and collectors can be swapped or layered independently.
//!
//! ## Core Concepts
//!
//! - **Registry**: immutable catalog of specialist handlers, built once at startup
//! - **Strategy**: a `Service<StrategyRequest, Response = Proposal>` proposing a handler
//!   (keyword tags, a hybrid keyword/model blend, or an external delegation framework)
//! - **Executor**: attachment overrides, confidence floor, one fallback, apology on failure
//! - **Parallel batches**: explicit fan-out to several handlers with per-call deadlines
//!   and a global concurrency ceiling
//! - **Confirmation gate**: suspends a turn when a handler asks the user to confirm,
//!   and resumes it exactly once on the answer
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_openai::{config::OpenAIConfig, Client};
//! use tower::util::BoxCloneSyncService;
//! use tower_agent_router::provider::OpenAIProvider;
//! use tower_agent_router::{RouterConfig, RouterEngine, RoutingRequest};
//!
//! # async fn example() -> tower_agent_router::Result<()> {
//! let provider = BoxCloneSyncService::new(OpenAIProvider::new(Arc::new(Client::<OpenAIConfig>::new())));
//! let engine = RouterEngine::builder(RouterConfig::default())
//!     .household_catalog(provider, "gpt-4o-mini")
//!     .build()?;
//!
//! let request = RoutingRequest::builder("user-1", "session-1")
//!     .message("My son has a fever, should we see a doctor?")
//!     .build()?;
//! let response = engine.route(request).await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod confirmation;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod model;
pub mod observability;
pub mod overrides;
pub mod parallel;
pub mod provider;
pub mod registry;
pub mod resilience;
pub mod sessions;
pub mod strategy;

// Public re-exports for convenience
pub use config::{ConfigBuilder, RouterConfig};
pub use confirmation::{
    ConfirmationEnvelope, ConfirmationGate, InMemoryConfirmationStore, PendingConfirmationStore,
    SqliteConfirmationStore,
};
pub use engine::{EngineBuilder, RouterEngine};
pub use error::{ConfirmationError, Result, RouterError, ValidationError};
pub use model::{
    AgentResponse, Attachment, AttachmentKind, FallbackReason, ParallelBatchResult, ResponseBody,
    RouteResponse, RoutingDecision, RoutingRequest, Turn,
};
pub use registry::{AgentDescriptor, AgentRegistry, HandlerReply, HandlerRequest};
pub use strategy::{Proposal, StrategyRequest};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};

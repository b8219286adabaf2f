//! Agent registry
//!
//! Exports
//! - Models
//!   - `AgentDescriptor { id, label, tags, class, handler }`
//!   - `HandlerRequest { handler_id, payload }`, `HandlerReply { text, confidence, error }`
//! - Services
//!   - `Handler: Service<HandlerRequest, Response=HandlerReply>` (boxed as `HandlerSvc`)
//! - Utils
//!   - `RegistryBuilder` assembling an immutable `AgentRegistry`
//!
//! The registry is built once by the assembly root and shared behind an `Arc`;
//! there is no registration after `build()`.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};

use crate::context::ContextPayload;
use crate::error::{Result, RouterError};

/// Rough prior reliability of a handler, used as a tie breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceClass {
    Low,
    Medium,
    High,
}

/// Request handed to a specialist handler.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub handler_id: String,
    pub payload: ContextPayload,
}

/// What a handler returns. A populated `error` marks the reply as a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReply {
    pub text: String,
    pub confidence: f32,
    pub error: Option<String>,
}

impl HandlerReply {
    pub fn text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            error: Some(message.into()),
        }
    }
}

/// Handler service trait alias.
pub trait Handler: Service<HandlerRequest, Response = HandlerReply, Error = BoxError> {}
impl<T> Handler for T where T: Service<HandlerRequest, Response = HandlerReply, Error = BoxError> {}

/// Boxed handler service type alias.
pub type HandlerSvc = BoxCloneSyncService<HandlerRequest, HandlerReply, BoxError>;

/// Static description of a registered specialist.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub id: String,
    pub label: String,
    pub tags: BTreeSet<String>,
    pub class: ConfidenceClass,
    handler: HandlerSvc,
}

impl AgentDescriptor {
    pub fn new<S>(id: impl Into<String>, label: impl Into<String>, handler: S) -> Self
    where
        S: Service<HandlerRequest, Response = HandlerReply, Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            id: id.into(),
            label: label.into(),
            tags: BTreeSet::new(),
            class: ConfidenceClass::Medium,
            handler: BoxCloneSyncService::new(handler),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|t| t.into().to_lowercase()));
        self
    }

    pub fn with_class(mut self, class: ConfidenceClass) -> Self {
        self.class = class;
        self
    }

    /// A fresh handle to the handler; clones are cheap and independent.
    pub fn handler(&self) -> HandlerSvc {
        self.handler.clone()
    }
}

impl std::fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("tags", &self.tags)
            .field("class", &self.class)
            .finish()
    }
}

/// Immutable id → descriptor catalog preserving registration order.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
    index: HashMap<String, usize>,
    default_id: String,
    excluded: BTreeSet<String>,
}

impl AgentRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.index.get(id).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn default_agent(&self) -> &AgentDescriptor {
        // build() guarantees presence
        &self.agents[self.index[&self.default_id]]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.id.as_str())
    }

    /// Handlers a text strategy may pick: everything except the default handler
    /// and handlers reserved for attachment overrides.
    pub fn candidates(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents
            .iter()
            .filter(move |a| a.id != self.default_id && !self.excluded.contains(&a.id))
    }

    /// Position in registration order, used for deterministic tie breaks.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    agents: Vec<AgentDescriptor>,
    default_id: Option<String>,
    excluded: BTreeSet<String>,
}

impl RegistryBuilder {
    pub fn agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.agents.push(descriptor);
        self
    }

    pub fn default_handler(mut self, id: impl Into<String>) -> Self {
        self.default_id = Some(id.into());
        self
    }

    /// Keeps a handler out of text-based candidate lists.
    pub fn reserve(mut self, id: impl Into<String>) -> Self {
        self.excluded.insert(id.into());
        self
    }

    pub fn build(self) -> Result<AgentRegistry> {
        let default_id = self
            .default_id
            .ok_or_else(|| RouterError::config("registry needs a default handler"))?;
        let mut index = HashMap::with_capacity(self.agents.len());
        for (i, agent) in self.agents.iter().enumerate() {
            if agent.id.trim().is_empty() {
                return Err(RouterError::config("agent id must not be empty"));
            }
            if index.insert(agent.id.clone(), i).is_some() {
                return Err(RouterError::config(format!(
                    "agent '{}' registered twice",
                    agent.id
                )));
            }
        }
        if !index.contains_key(&default_id) {
            return Err(RouterError::config(format!(
                "default handler '{default_id}' is not registered"
            )));
        }
        if self.excluded.contains(&default_id) {
            return Err(RouterError::config(
                "the default handler cannot be reserved for overrides",
            ));
        }
        Ok(AgentRegistry {
            agents: self.agents,
            index,
            default_id,
            excluded: self.excluded,
        })
    }
}

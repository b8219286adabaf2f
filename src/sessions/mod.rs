//! Session context for routing requests
//!
//! What this module provides
//! - A Tower-native way to enrich requests with what the assistant already knows
//!   about a session (recent turns, household facts) without the caller resending it
//! - Read-only: routing never writes session state
//!
//! Exports
//! - Models
//!   - `SessionId` (newtype)
//!   - `LoadSession { id }`, `SessionSnapshot { history, household }`
//! - Services
//!   - `SessionStore: Service<LoadSession, Response=SessionSnapshot, Error=BoxError>`
//!     - Impl: `InMemorySessionStore`
//! - Layers
//!   - `SessionContextLayer<L>` wrapping any `Service<RoutingRequest>`
//!     - On call: loads the snapshot for the request's session, fills history and
//!       household where the request carried none, forwards
//!
//! Testing strategy
//! - Fake stores via `tower::service_fn`, an inner service that records what it received

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::trace;

use crate::model::{RoutingRequest, Turn};

/// Session identifier newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Load request for a session.
#[derive(Debug, Clone)]
pub struct LoadSession {
    pub id: SessionId,
}

/// What is known about a session. Empty for sessions the store has never seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub history: Vec<Turn>,
    pub household: Option<BTreeMap<String, Value>>,
}

/// Session store service trait alias.
pub trait SessionStore: Service<LoadSession, Response = SessionSnapshot, Error = BoxError> {}
impl<T> SessionStore for T where T: Service<LoadSession, Response = SessionSnapshot, Error = BoxError> {}

/// Boxed session store type alias.
pub type SessionSvc = BoxCloneSyncService<LoadSession, SessionSnapshot, BoxError>;

/// A simple in-memory session store.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<SessionId, SessionSnapshot>>>,
}

impl InMemorySessionStore {
    /// Seeds or replaces a session's snapshot.
    pub fn insert(&self, id: impl Into<SessionId>, snapshot: SessionSnapshot) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id.into(), snapshot);
        }
    }
}

impl Service<LoadSession> for InMemorySessionStore {
    type Response = SessionSnapshot;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LoadSession) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let map = inner.lock().map_err(|_| "session store lock poisoned")?;
            Ok(map.get(&req.id).cloned().unwrap_or_default())
        })
    }
}

/// Layer filling requests from a session store.
#[derive(Clone)]
pub struct SessionContextLayer<L> {
    store: L,
}

impl<L> SessionContextLayer<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }
}

/// Wrapped service that loads the session snapshot before the call.
#[derive(Clone)]
pub struct SessionContext<S, L> {
    inner: S,
    store: L,
}

impl<S, L: Clone> Layer<S> for SessionContextLayer<L> {
    type Service = SessionContext<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionContext {
            inner,
            store: self.store.clone(),
        }
    }
}

impl<S, L> Service<RoutingRequest> for SessionContext<S, L>
where
    S: Service<RoutingRequest> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    L: Service<LoadSession, Response = SessionSnapshot, Error = BoxError> + Clone + Send + 'static,
    L::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RoutingRequest) -> Self::Future {
        let store = self.store.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let snapshot = store
                .oneshot(LoadSession {
                    id: SessionId(req.session_id().to_string()),
                })
                .await?;
            trace!(
                session_id = req.session_id(),
                turns = snapshot.history.len(),
                "session snapshot loaded"
            );
            let req = req.with_session_defaults(snapshot.history, snapshot.household);
            inner.oneshot(req).await.map_err(Into::into)
        })
    }
}

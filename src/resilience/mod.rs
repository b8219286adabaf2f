//! Resilience layers: per-invocation deadline and global concurrency ceiling
//!
//! What this module provides
//! - Tower middleware applied around every handler invocation, single or parallel
//!
//! Exports
//! - Layers
//!   - `DeadlineLayer(Duration)`: fails the call with [`DeadlineElapsed`] once the budget is spent
//!   - `ConcurrencyCeilingLayer(Arc<Semaphore>)`: holds a permit from a semaphore shared by all requests
//! - Utils
//!   - `guard_handler` composing both in the order the engine uses
//!
//! Implementation strategy
//! - The permit is acquired inside the call future, not in `poll_ready`, so that a
//!   deadline placed outside the ceiling also bounds the wait for a permit
//! - Dropping the returned future drops the inner future and releases the permit
//!
//! Testing strategy
//! - Fake handlers that sleep, counting peak concurrency with atomics

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tower::{BoxError, Layer, Service, ServiceBuilder};

use crate::registry::HandlerSvc;

/// A handler invocation ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handler timed out after {}ms", .after.as_millis())]
pub struct DeadlineElapsed {
    pub after: Duration,
}

// ===== Deadline =====

#[derive(Debug, Clone, Copy)]
pub struct DeadlineLayer {
    dur: Duration,
}

impl DeadlineLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

#[derive(Debug, Clone)]
pub struct Deadline<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = Deadline<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Deadline {
            inner,
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Deadline<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let dur = self.dur;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err::<S::Response, BoxError>(Box::new(DeadlineElapsed { after: dur })),
            }
        })
    }
}

// ===== Concurrency ceiling =====

/// Shares one semaphore across every service it wraps.
#[derive(Debug, Clone)]
pub struct ConcurrencyCeilingLayer {
    permits: Arc<Semaphore>,
}

impl ConcurrencyCeilingLayer {
    pub fn new(permits: Arc<Semaphore>) -> Self {
        Self { permits }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyCeiling<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> Layer<S> for ConcurrencyCeilingLayer {
    type Service = ConcurrencyCeiling<S>;
    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyCeiling {
            inner,
            permits: self.permits.clone(),
        }
    }
}

impl<S, Req> Service<Req> for ConcurrencyCeiling<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
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

    fn call(&mut self, req: Req) -> Self::Future {
        // readiness is driven after the permit is held
        let inner = self.inner.clone();
        let permits = self.permits.clone();
        Box::pin(async move {
            let _permit = permits.acquire_owned().await?;
            tower::ServiceExt::oneshot(inner, req).await
        })
    }
}

/// Handler wrapped with the shared ceiling, then the deadline (outermost).
pub fn guard_handler(handler: HandlerSvc, permits: Arc<Semaphore>, deadline: Duration) -> HandlerSvc {
    tower::util::BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(DeadlineLayer::new(deadline))
            .layer(ConcurrencyCeilingLayer::new(permits))
            .service(handler),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn deadline_triggers_typed_error() {
        let svc = service_fn(|()| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<(), BoxError>(())
        });
        let err = DeadlineLayer::new(Duration::from_millis(5))
            .layer(svc)
            .oneshot(())
            .await
            .unwrap_err();
        let elapsed = err.downcast_ref::<DeadlineElapsed>().unwrap();
        assert_eq!(elapsed.after, Duration::from_millis(5));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn ceiling_is_shared_between_services() {
        let permits = Arc::new(Semaphore::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let make = || {
            let active = active.clone();
            let peak = peak.clone();
            ConcurrencyCeilingLayer::new(permits.clone()).layer(service_fn(move |()| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            }))
        };
        let a = make();
        let b = make();
        let calls = (0..6).map(|i| {
            let svc = if i % 2 == 0 { a.clone() } else { b.clone() };
            svc.oneshot(())
        });
        for r in futures::future::join_all(calls).await {
            r.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn deadline_covers_permit_wait() {
        let permits = Arc::new(Semaphore::new(1));
        let _held = permits.clone().acquire_owned().await.unwrap();
        let handler: HandlerSvc = crate::registry::test_support::echo("never");
        let guarded = guard_handler(handler, permits.clone(), Duration::from_millis(10));
        let req = crate::registry::HandlerRequest {
            handler_id: "x".into(),
            payload: Default::default(),
        };
        let err = guarded.oneshot(req).await.unwrap_err();
        assert!(err.is::<DeadlineElapsed>());
    }
}

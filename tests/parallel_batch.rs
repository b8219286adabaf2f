//! Fan-out accounting, the global ceiling and cancellation of in-flight branches.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{failing, household, replying};
use tower::util::BoxCloneSyncService;
use tower::{service_fn, BoxError};
use tower_agent_router::parallel::NO_ANSWER;
use tower_agent_router::registry::HandlerSvc;
use tower_agent_router::{
    AgentDescriptor, ConfigBuilder, HandlerReply, HandlerRequest, RouterConfig, RouterEngine,
    RouterError, RoutingRequest, ValidationError,
};

fn batch(targets: &[&str]) -> RoutingRequest {
    RoutingRequest::builder("u1", "s1")
        .message("what should we do this weekend?")
        .targets(targets.iter().copied())
        .build()
        .unwrap()
}

#[tokio::test]
async fn k_failures_out_of_n_leave_n_minus_k_answers() {
    let engine = household(RouterConfig::default())
        .agent(AgentDescriptor::new("finance", "Money", failing("bank api down")))
        .agent(AgentDescriptor::new("pets", "Pets", failing("vet records locked")))
        .build()
        .unwrap();

    let result = engine
        .route_parallel(batch(&["health", "finance", "nutrition", "pets"]))
        .await
        .unwrap();
    assert_eq!(result.responses.len(), 4);
    assert_eq!(result.succeeded().count(), 2);
    assert_eq!(result.responses.iter().filter(|r| !r.success).count(), 2);
    for failed in result.responses.iter().filter(|r| !r.success) {
        assert!(failed.error.is_some());
        assert!(!result.summary.contains(&failed.handler_id));
    }
}

#[tokio::test]
async fn every_branch_failing_is_still_a_result() {
    let engine = household(RouterConfig::default())
        .agent(AgentDescriptor::new("finance", "Money", failing("down")))
        .build()
        .unwrap();
    let resp = engine.route(batch(&["finance"])).await.unwrap();
    assert!(!resp.success);
    assert_eq!(resp.text, NO_ANSWER);
}

#[tokio::test]
async fn validation_happens_before_any_invocation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let counted: HandlerSvc = BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(HandlerReply::text("ok", 0.5)) }
    }));
    let config = ConfigBuilder::new().max_parallel_handlers(2).build().unwrap();
    let engine = household(config)
        .agent(AgentDescriptor::new("counted", "Counted", counted))
        .build()
        .unwrap();

    let err = engine
        .route_parallel(batch(&["counted", "health", "nutrition"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Validation(ValidationError::BatchCapExceeded { requested: 3, cap: 2 })
    ));
    let err = engine
        .route_parallel(batch(&["counted", "ghost"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Validation(ValidationError::UnknownHandler { .. })
    ));
    let err = engine
        .route_parallel(batch(&["counted", "counted"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::Validation(ValidationError::DuplicateHandler { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let no_targets = RoutingRequest::builder("u1", "s1").message("hi").build().unwrap();
    assert!(matches!(
        engine.route_parallel(no_targets).await.unwrap_err(),
        RouterError::Validation(ValidationError::NoTargets)
    ));
}

fn gauge(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> HandlerSvc {
    BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| {
        let active = active.clone();
        let peak = peak.clone();
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, BoxError>(HandlerReply::text("done", 0.6))
        }
    }))
}

#[tokio::test]
async fn global_ceiling_bounds_outstanding_invocations() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let config = ConfigBuilder::new()
        .global_concurrency(2)
        .max_parallel_handlers(6)
        .build()
        .unwrap();
    let mut builder = RouterEngine::builder(config)
        .agent(AgentDescriptor::new("general", "General", replying("hi")))
        .agent(AgentDescriptor::new("image_handler", "Images", replying("img")))
        .agent(AgentDescriptor::new("voice_handler", "Voice", replying("voice")));
    let ids = ["a", "b", "c", "d", "e", "f"];
    for id in ids {
        builder = builder.agent(AgentDescriptor::new(id, id, gauge(active.clone(), peak.clone())));
    }
    let engine = builder.build().unwrap();

    // two concurrent batches share the one semaphore
    let (first, second) = tokio::join!(
        engine.route_parallel(batch(&ids[..3])),
        engine.route_parallel(batch(&ids[3..])),
    );
    assert_eq!(first.unwrap().succeeded().count(), 3);
    assert_eq!(second.unwrap().succeeded().count(), 3);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

struct DropFlag(Arc<AtomicUsize>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn dropping_the_batch_cancels_every_branch() {
    let dropped = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let slow = {
        let dropped = dropped.clone();
        let finished = finished.clone();
        BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| {
            let flag = DropFlag(dropped.clone());
            let finished = finished.clone();
            async move {
                let _flag = flag;
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(HandlerReply::text("late", 0.5))
            }
        }))
    };
    let engine = household(RouterConfig::default())
        .agent(AgentDescriptor::new("slow_a", "Slow A", slow.clone()))
        .agent(AgentDescriptor::new("slow_b", "Slow B", slow))
        .build()
        .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        engine.route_parallel(batch(&["slow_a", "slow_b"])),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

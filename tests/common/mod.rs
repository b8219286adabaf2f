#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tower::util::BoxCloneSyncService;
use tower::{service_fn, BoxError};
use tower_agent_router::context::ContextPayload;
use tower_agent_router::registry::HandlerSvc;
use tower_agent_router::{AgentDescriptor, EngineBuilder, HandlerReply, HandlerRequest, RouterConfig, RouterEngine};

pub fn replying(text: &'static str) -> HandlerSvc {
    BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| async move {
        Ok::<_, BoxError>(HandlerReply::text(text, 0.8))
    }))
}

pub fn failing(message: &'static str) -> HandlerSvc {
    BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| async move {
        Err::<HandlerReply, BoxError>(message.into())
    }))
}

pub fn sleeping(delay: Duration, text: &'static str) -> HandlerSvc {
    BoxCloneSyncService::new(service_fn(move |_req: HandlerRequest| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, BoxError>(HandlerReply::text(text, 0.7))
    }))
}

/// Handler that answers with `text` and keeps every payload it received.
pub fn recording(text: &'static str) -> (Arc<Mutex<Vec<ContextPayload>>>, HandlerSvc) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let svc = BoxCloneSyncService::new(service_fn(move |req: HandlerRequest| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(req.payload);
            Ok::<_, BoxError>(HandlerReply::text(text, 0.8))
        }
    }));
    (seen, svc)
}

/// General, image and voice handlers plus a few tagged specialists.
pub fn household(config: RouterConfig) -> EngineBuilder {
    RouterEngine::builder(config)
        .agent(AgentDescriptor::new("general", "General assistant", replying("Happy to help with that.")))
        .agent(AgentDescriptor::new("image_handler", "Image understanding", replying("That looks like a rash.")))
        .agent(AgentDescriptor::new("voice_handler", "Voice notes", replying("I heard: pick up milk.")))
        .agent(
            AgentDescriptor::new("health", "Family health", replying("Keep them hydrated and rested."))
                .with_tags(["fever", "cough", "doctor", "medicine"]),
        )
        .agent(
            AgentDescriptor::new("nutrition", "Meals and nutrition", replying("Lentil soup is quick."))
                .with_tags(["dinner", "recipe", "meal plan"]),
        )
        .agent(
            AgentDescriptor::new("schedule", "Family calendar", replying("Thursday at 4pm is free."))
                .with_tags(["calendar", "appointment", "schedule"]),
        )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! The engine as a Tower service under the session and metrics layers.

mod common;

use std::collections::BTreeMap;

use common::{household, recording};
use serde_json::json;
use tower::{ServiceBuilder, ServiceExt};
use tower_agent_router::context::ContextSection;
use tower_agent_router::observability::{
    MetricsLayer, RecordingCollector, CONFIRMATIONS_PENDING, FALLBACKS, ROUTES_TOTAL,
};
use tower_agent_router::sessions::{InMemorySessionStore, SessionContextLayer, SessionSnapshot};
use tower_agent_router::{AgentDescriptor, RouterConfig, RoutingRequest, Turn};

#[tokio::test]
async fn session_history_reaches_the_handler_and_metrics_are_counted() {
    let (seen, pets) = recording("Walk Biscuit before dinner.");
    let engine = household(RouterConfig::default())
        .agent(AgentDescriptor::new("pets", "Pets", pets).with_tags(["dog", "walk", "vet"]))
        .build()
        .unwrap();

    let sessions = InMemorySessionStore::default();
    let mut facts = BTreeMap::new();
    facts.insert("dog".to_string(), json!("Biscuit"));
    sessions.insert(
        "living-room",
        SessionSnapshot {
            history: vec![Turn::user("we adopted a beagle"), Turn::assistant("Congratulations!")],
            household: Some(facts),
        },
    );
    let collector = RecordingCollector::default();

    let svc = ServiceBuilder::new()
        .layer(MetricsLayer::new(collector.clone()))
        .layer(SessionContextLayer::new(sessions))
        .service(engine);

    let req = RoutingRequest::builder("parent-1", "living-room")
        .message("when should I walk the dog?")
        .build()
        .unwrap();
    let resp = svc.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.text, "Walk Biscuit before dinner.");

    let payloads = seen.lock().unwrap().clone();
    let kinds: Vec<_> = payloads[0]
        .sections
        .iter()
        .map(|s| match s {
            ContextSection::History { turns } => format!("history:{}", turns.len()),
            ContextSection::Household { .. } => "household".to_string(),
            ContextSection::Message { .. } => "message".to_string(),
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec!["history:2", "household", "message"]);

    let unknown = RoutingRequest::builder("parent-1", "living-room")
        .message("zzzz qqqq")
        .build()
        .unwrap();
    svc.oneshot(unknown).await.unwrap();

    assert_eq!(collector.counter(ROUTES_TOTAL), 2);
    assert_eq!(collector.counter(FALLBACKS), 1);
    assert_eq!(collector.counter(CONFIRMATIONS_PENDING), 0);
}

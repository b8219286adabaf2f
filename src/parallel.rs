//! Parallel fan-out across explicitly requested handlers.
//!
//! Every branch runs under the same deadline and shared ceiling as single
//! invocations. Branches are driven by `join_all` inside the caller's task, so
//! dropping the batch future cancels every in-flight branch with it.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, info};

use crate::context::ContextBuilder;
use crate::error::{Result, ValidationError};
use crate::executor::Invoker;
use crate::model::{AgentResponse, ParallelBatchResult, RoutingRequest};
use crate::registry::AgentRegistry;

/// Summary used when every branch failed.
pub const NO_ANSWER: &str = "No handler could answer this request.";

/// Rejects a target list before anything is invoked.
pub fn validate_targets(
    targets: &[String],
    registry: &AgentRegistry,
    cap: usize,
) -> std::result::Result<(), ValidationError> {
    if targets.is_empty() {
        return Err(ValidationError::NoTargets);
    }
    if targets.len() > cap {
        return Err(ValidationError::BatchCapExceeded {
            requested: targets.len(),
            cap,
        });
    }
    let mut seen = HashSet::with_capacity(targets.len());
    for id in targets {
        if !registry.contains(id) {
            return Err(ValidationError::UnknownHandler {
                handler_id: id.clone(),
            });
        }
        if !seen.insert(id.as_str()) {
            return Err(ValidationError::DuplicateHandler {
                handler_id: id.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ParallelCoordinator {
    invoker: Invoker,
    context: ContextBuilder,
    max_parallel: usize,
}

impl ParallelCoordinator {
    pub fn new(invoker: Invoker, context: ContextBuilder, max_parallel: usize) -> Self {
        Self {
            invoker,
            context,
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Runs every target and waits for all of them to settle.
    pub async fn run(&self, request: &RoutingRequest) -> Result<ParallelBatchResult> {
        let registry = self.invoker.registry().clone();
        validate_targets(request.targets(), &registry, self.max_parallel)?;

        let payload = self.context.build(request);
        info!(targets = request.targets().len(), "fanning out");
        let branches = request.targets().iter().map(|id| {
            let payload = payload.clone();
            async move { self.invoker.invoke(id, payload).await }
        });
        let responses: Vec<AgentResponse> = join_all(branches)
            .await
            .into_iter()
            .map(inline_confirmation)
            .collect();

        let confidences: HashMap<String, f32> = responses
            .iter()
            .map(|r| (r.handler_id.clone(), r.confidence))
            .collect();
        let summary = summarize(&registry, &responses);
        debug!(
            succeeded = responses.iter().filter(|r| r.success).count(),
            failed = responses.iter().filter(|r| !r.success).count(),
            "batch settled"
        );
        Ok(ParallelBatchResult {
            responses,
            summary,
            confidences,
        })
    }
}

/// Batches never suspend; a marker's question is folded into the text instead.
fn inline_confirmation(mut response: AgentResponse) -> AgentResponse {
    if !response.success {
        return response;
    }
    if let Some(marker) = crate::confirmation::marker::find_marker(&response.text) {
        let rest = marker.strip_from(&response.text);
        response.text = if rest.trim().is_empty() {
            marker.question
        } else {
            format!("{}\n\n{}", rest.trim_end(), marker.question)
        };
    }
    response
}

/// One labelled section per successful response, in request order.
pub fn summarize(registry: &AgentRegistry, responses: &[AgentResponse]) -> String {
    let sections: Vec<String> = responses
        .iter()
        .filter(|r| r.success)
        .map(|r| {
            let label = registry
                .get(&r.handler_id)
                .map(|a| a.label.as_str())
                .unwrap_or(r.handler_id.as_str());
            format!("{label}:\n{}", r.text.trim())
        })
        .collect();
    if sections.is_empty() {
        NO_ANSWER.to_string()
    } else {
        sections.join("\n\n")
    }
}

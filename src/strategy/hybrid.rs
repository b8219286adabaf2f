//! Hybrid strategy: keyword scores blended with an external model's scores.
//!
//! `blended = keyword_weight * keyword + model_weight * model` per candidate.
//! The weights are checked once at construction. When the scorer fails the
//! strategy keeps going on keyword evidence alone (model score 0) and says so in
//! the rationale.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, warn};

use super::keyword::{best_by, keyword_scores};
use super::{candidate_infos, CandidateInfo, Proposal, StrategyRequest};
use crate::config::HybridWeights;
use crate::confirmation::marker::json_objects;
use crate::error::Result;
use crate::model::clamp_confidence;
use crate::provider::ModelSvc;

pub const STRATEGY_NAME: &str = "hybrid";

/// What the model scorer is asked.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub message: String,
    pub candidates: Vec<CandidateInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerScore {
    pub handler_id: String,
    pub score: f32,
}

/// Model scorer service trait alias.
pub trait ModelScorer: Service<ScoreRequest, Response = Vec<HandlerScore>, Error = BoxError> {}
impl<T> ModelScorer for T where T: Service<ScoreRequest, Response = Vec<HandlerScore>, Error = BoxError> {}

/// Boxed scorer service type alias.
pub type ScorerSvc = BoxCloneSyncService<ScoreRequest, Vec<HandlerScore>, BoxError>;

#[derive(Clone)]
pub struct HybridStrategy {
    scorer: ScorerSvc,
    weights: HybridWeights,
}

impl HybridStrategy {
    pub fn new(scorer: ScorerSvc, weights: HybridWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { scorer, weights })
    }

    pub fn weights(&self) -> HybridWeights {
        self.weights
    }
}

impl Service<StrategyRequest> for HybridStrategy {
    type Response = Proposal;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StrategyRequest) -> Self::Future {
        let scorer = self.scorer.clone();
        let weights = self.weights;
        Box::pin(async move {
            let registry = req.registry.clone();
            let keyword = keyword_scores(req.request.message(), &registry);

            let score_req = ScoreRequest {
                message: req.request.message().to_string(),
                candidates: candidate_infos(&registry),
            };
            let (model, note) = match scorer.oneshot(score_req).await {
                Ok(scores) => {
                    let map: HashMap<String, f32> = scores
                        .into_iter()
                        .filter(|s| registry.contains(&s.handler_id))
                        .map(|s| (s.handler_id, clamp_confidence(s.score)))
                        .collect();
                    (map, None)
                }
                Err(e) => {
                    warn!(error = %e, "model scorer failed, using keyword scores only");
                    (HashMap::new(), Some(format!("model scorer unavailable ({e})")))
                }
            };

            let blended: Vec<(&str, f32, f32, f32)> = keyword
                .iter()
                .map(|k| {
                    let m = model.get(&k.handler_id).copied().unwrap_or(0.0);
                    let score = weights.keyword * k.confidence + weights.model * m;
                    (k.handler_id.as_str(), k.confidence, m, score)
                })
                .collect();
            debug!(candidates = blended.len(), "hybrid scores computed");

            let best = best_by(&registry, blended.iter().map(|(id, _, _, s)| (*id, *s)));
            let mut proposal = match best {
                Some((id, score)) => {
                    let (_, kw, m, _) = blended
                        .iter()
                        .find(|(candidate, ..)| *candidate == id)
                        .copied()
                        .unwrap_or((id, 0.0, 0.0, score));
                    Proposal::new(
                        id,
                        score,
                        format!(
                            "'{id}': keyword {kw:.2} x {:.2} + model {m:.2} x {:.2} = {score:.2}",
                            weights.keyword, weights.model
                        ),
                        STRATEGY_NAME,
                    )
                }
                None => Proposal::uncertain(
                    &registry,
                    STRATEGY_NAME,
                    "neither keywords nor the model favoured any handler",
                ),
            };
            if let Some(note) = note {
                proposal.rationale = format!("{}; {note}", proposal.rationale);
            }
            Ok(proposal)
        })
    }
}

/// Scorer that asks a chat model for a JSON object of per-handler scores.
#[derive(Clone)]
pub struct LlmScorer {
    provider: ModelSvc,
    model: String,
}

impl LlmScorer {
    pub fn new(provider: ModelSvc, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

const SCORER_PROMPT: &str = "You rate how well each household assistant specialist fits a user's message. \
Reply with JSON only, shaped as {\"scores\": {\"<handler id>\": <number between 0 and 1>}}. \
Include every handler id you are given.";

fn parse_scores(content: &str) -> std::result::Result<Vec<HandlerScore>, BoxError> {
    for (_, value) in json_objects(content) {
        let table = match value.get("scores") {
            Some(Value::Object(map)) => map.clone(),
            _ => continue,
        };
        return Ok(table
            .into_iter()
            .filter_map(|(handler_id, v)| {
                v.as_f64().map(|score| HandlerScore {
                    handler_id,
                    score: score as f32,
                })
            })
            .collect());
    }
    Err("scorer reply contained no scores object".into())
}

impl Service<ScoreRequest> for LlmScorer {
    type Response = Vec<HandlerScore>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScoreRequest) -> Self::Future {
        let provider = self.provider.clone();
        let model = self.model.clone();
        Box::pin(async move {
            let listing = serde_json::to_string_pretty(&req.candidates)?;
            let chat = CreateChatCompletionRequestArgs::default()
                .model(model)
                .messages(vec![
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(SCORER_PROMPT)
                        .build()?
                        .into(),
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(format!("Handlers:\n{listing}\n\nMessage:\n{}", req.message))
                        .build()?
                        .into(),
                ])
                .build()?;
            let reply = provider.oneshot(chat).await?;
            parse_scores(reply.content.as_deref().unwrap_or_default())
        })
    }
}

//! Keyword strategy: capability tags matched against the message text.

use std::future::Future;
use std::pin::Pin;

use tower::{BoxError, Service};
use tracing::trace;

use super::{Proposal, StrategyRequest};
use crate::registry::AgentRegistry;

pub const STRATEGY_NAME: &str = "keyword";
/// Confidence for a tag found as a whole word (or word sequence).
pub const WHOLE_WORD_CONFIDENCE: f32 = 0.9;
/// Confidence for a tag found only inside a longer word, or a word that is a prefix of a tag.
pub const PARTIAL_CONFIDENCE: f32 = 0.5;
/// Shortest fragment considered for partial matching.
const MIN_PARTIAL_LEN: usize = 4;

/// Keyword score for one candidate handler.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordScore {
    pub handler_id: String,
    pub confidence: f32,
    pub matched: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    None,
    Partial,
    Whole,
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn match_tag(tag: &str, words: &[String], lowered: &str) -> MatchKind {
    let tag_words: Vec<&str> = tag.split_whitespace().collect();
    if tag_words.is_empty() {
        return MatchKind::None;
    }
    if words
        .windows(tag_words.len())
        .any(|w| w.iter().zip(&tag_words).all(|(a, b)| a == b))
    {
        return MatchKind::Whole;
    }
    if tag.len() >= MIN_PARTIAL_LEN && lowered.contains(tag) {
        return MatchKind::Partial;
    }
    if tag_words.len() == 1
        && words
            .iter()
            .any(|w| w.len() >= MIN_PARTIAL_LEN && tag.starts_with(w.as_str()))
    {
        return MatchKind::Partial;
    }
    MatchKind::None
}

/// Scores every candidate in registration order. Handlers without a match get 0.
pub fn keyword_scores(message: &str, registry: &AgentRegistry) -> Vec<KeywordScore> {
    let lowered = message.to_lowercase();
    let words = words(message);
    registry
        .candidates()
        .map(|agent| {
            let mut best = MatchKind::None;
            let mut matched = Vec::new();
            for tag in &agent.tags {
                let kind = match_tag(tag, &words, &lowered);
                if kind > MatchKind::None {
                    matched.push(tag.clone());
                    best = best.max(kind);
                }
            }
            let confidence = match best {
                MatchKind::Whole => WHOLE_WORD_CONFIDENCE,
                MatchKind::Partial => PARTIAL_CONFIDENCE,
                MatchKind::None => 0.0,
            };
            KeywordScore {
                handler_id: agent.id.clone(),
                confidence,
                matched,
            }
        })
        .collect()
}

/// Picks the highest score; ties go to the higher confidence class, then to the
/// earlier registration.
pub(crate) fn best_by<'a, I>(registry: &AgentRegistry, scored: I) -> Option<(&'a str, f32)>
where
    I: IntoIterator<Item = (&'a str, f32)>,
{
    scored
        .into_iter()
        .filter(|(_, s)| *s > 0.0)
        .max_by(|(a_id, a), (b_id, b)| {
            a.total_cmp(b)
                .then_with(|| {
                    let class = |id: &str| registry.get(id).map(|d| d.class);
                    class(a_id).cmp(&class(b_id))
                })
                .then_with(|| {
                    // earlier registration wins, so reverse the position order
                    registry.position(b_id).cmp(&registry.position(a_id))
                })
        })
}

/// Stateless keyword router.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordStrategy;

impl KeywordStrategy {
    pub fn decide(&self, req: &StrategyRequest) -> Proposal {
        let registry = &req.registry;
        let scores = keyword_scores(req.request.message(), registry);
        let best = best_by(
            registry,
            scores.iter().map(|s| (s.handler_id.as_str(), s.confidence)),
        );
        match best {
            Some((id, confidence)) => {
                let matched = scores
                    .iter()
                    .find(|s| s.handler_id == id)
                    .map(|s| s.matched.join(", "))
                    .unwrap_or_default();
                trace!(handler = id, confidence, "keyword match");
                Proposal::new(
                    id,
                    confidence,
                    format!("matched tags [{matched}] for '{id}'"),
                    STRATEGY_NAME,
                )
            }
            None => Proposal::uncertain(registry, STRATEGY_NAME, "no capability tag matched the message"),
        }
    }
}

impl Service<StrategyRequest> for KeywordStrategy {
    type Response = Proposal;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StrategyRequest) -> Self::Future {
        let proposal = self.decide(&req);
        Box::pin(async move { Ok(proposal) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{registry, strategy_request};
    use tower::ServiceExt;

    #[test]
    fn whole_word_beats_partial() {
        let reg = registry();
        let scores = keyword_scores("She has a fever and wants to cook", &reg);
        let health = scores.iter().find(|s| s.handler_id == "health").unwrap();
        assert_eq!(health.confidence, WHOLE_WORD_CONFIDENCE);
        assert_eq!(health.matched, vec!["fever".to_string()]);

        let scores = keyword_scores("fevers all week", &reg);
        let health = scores.iter().find(|s| s.handler_id == "health").unwrap();
        assert_eq!(health.confidence, PARTIAL_CONFIDENCE);
    }

    #[test]
    fn prefix_of_a_tag_is_partial() {
        let scores = keyword_scores("any recip ideas", &registry());
        let nutrition = scores.iter().find(|s| s.handler_id == "nutrition").unwrap();
        assert_eq!(nutrition.confidence, PARTIAL_CONFIDENCE);
    }

    #[test]
    fn ties_prefer_higher_class() {
        // "doctor" is tagged on both health (High) and schedule (Low)
        let p = KeywordStrategy.decide(&strategy_request("book the doctor"));
        assert_eq!(p.handler_id, "health");
        assert_eq!(p.confidence, WHOLE_WORD_CONFIDENCE);
        assert!(p.rationale.contains("doctor"));
    }

    #[test]
    fn reserved_handlers_are_not_candidates() {
        let p = KeywordStrategy.decide(&strategy_request("look at this photo"));
        assert_eq!(p.handler_id, "general");
        assert_eq!(p.confidence, 0.0);
    }

    #[tokio::test]
    async fn no_match_is_uncertain_not_an_error() {
        let p = KeywordStrategy
            .oneshot(strategy_request("qwzx blorp"))
            .await
            .unwrap();
        assert_eq!(p.handler_id, "general");
        assert_eq!(p.confidence, 0.0);
        assert!(p.rationale.contains("no capability tag"));
    }

    #[test]
    fn multi_word_tags_match_as_phrases() {
        let reg = std::sync::Arc::new(
            AgentRegistry::builder()
                .agent(crate::registry::AgentDescriptor::new(
                    "general",
                    "General",
                    crate::registry::test_support::echo("g"),
                ))
                .agent(
                    crate::registry::AgentDescriptor::new(
                        "parenting",
                        "Parenting",
                        crate::registry::test_support::echo("p"),
                    )
                    .with_tags(["screen time"]),
                )
                .default_handler("general")
                .build()
                .unwrap(),
        );
        let hit = keyword_scores("How much screen time is ok?", &reg);
        assert_eq!(hit[0].confidence, WHOLE_WORD_CONFIDENCE);
        let miss = keyword_scores("time on the screen", &reg);
        assert_eq!(miss[0].confidence, 0.0);
    }
}

//! Request, decision and response value types
//!
//! These are plain data: requests are built once through [`RoutingRequestBuilder`]
//! and never mutated afterwards, responses are produced once per invocation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::confirmation::ConfirmationEnvelope;
use crate::error::ValidationError;

/// Clamps a confidence into `[0, 1]`, mapping NaN to zero.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Voice,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Voice => "voice",
        }
    }
}

/// Media attached to a request, referenced by an opaque locator the handler can resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub reference: String,
}

impl Attachment {
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            reference: reference.into(),
        }
    }

    pub fn voice(reference: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Voice,
            reference: reference.into(),
        }
    }
}

/// Inbound routing request. Fields are read-only once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    message: String,
    user_id: String,
    session_id: String,
    history: Vec<Turn>,
    household: Option<BTreeMap<String, Value>>,
    attachment: Option<Attachment>,
    targets: Vec<String>,
}

impl RoutingRequest {
    pub fn builder(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> RoutingRequestBuilder {
        RoutingRequestBuilder {
            request: RoutingRequest {
                message: String::new(),
                user_id: user_id.into(),
                session_id: session_id.into(),
                history: Vec::new(),
                household: None,
                attachment: None,
                targets: Vec::new(),
            },
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn household(&self) -> Option<&BTreeMap<String, Value>> {
        self.household.as_ref()
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_parallel(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Copy of this request with history and household filled from a session
    /// snapshot where the request carried none.
    pub(crate) fn with_session_defaults(
        &self,
        history: Vec<Turn>,
        household: Option<BTreeMap<String, Value>>,
    ) -> Self {
        let mut next = self.clone();
        if next.history.is_empty() {
            next.history = history;
        }
        if next.household.is_none() {
            next.household = household;
        }
        next
    }
}

pub struct RoutingRequestBuilder {
    request: RoutingRequest,
}

impl RoutingRequestBuilder {
    pub fn message(mut self, text: impl Into<String>) -> Self {
        self.request.message = text.into();
        self
    }

    pub fn turn(mut self, turn: Turn) -> Self {
        self.request.history.push(turn);
        self
    }

    pub fn history(mut self, history: Vec<Turn>) -> Self {
        self.request.history = history;
        self
    }

    pub fn household_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.request
            .household
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn household(mut self, household: BTreeMap<String, Value>) -> Self {
        self.request.household = Some(household);
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.request.attachment = Some(attachment);
        self
    }

    pub fn target(mut self, handler_id: impl Into<String>) -> Self {
        self.request.targets.push(handler_id.into());
        self
    }

    pub fn targets<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.targets.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Checks the request is well formed.
    pub fn build(self) -> Result<RoutingRequest, ValidationError> {
        let req = self.request;
        if req.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "user_id" });
        }
        if req.session_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "session_id",
            });
        }
        if req.message.trim().is_empty() && req.attachment.is_none() {
            return Err(ValidationError::EmptyRequest);
        }
        if let Some(att) = &req.attachment {
            if att.reference.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "attachment.reference",
                });
            }
        }
        Ok(req)
    }
}

/// Why the executor left the strategy's proposal for the default handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FallbackReason {
    LowConfidence { confidence: f32, floor: f32 },
    UnknownHandler { handler_id: String },
    StrategyFailed { error: String },
    HandlerFailed { handler_id: String, error: String },
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::LowConfidence { confidence, floor } => {
                write!(f, "confidence {confidence:.2} below floor {floor:.2}")
            }
            FallbackReason::UnknownHandler { handler_id } => {
                write!(f, "proposed handler '{handler_id}' is not registered")
            }
            FallbackReason::StrategyFailed { error } => write!(f, "strategy failed: {error}"),
            FallbackReason::HandlerFailed { handler_id, error } => {
                write!(f, "handler '{handler_id}' failed: {error}")
            }
        }
    }
}

/// Which handler serves a request and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub handler_id: String,
    pub confidence: f32,
    pub rationale: String,
    pub strategy: String,
    pub fallback: Option<FallbackReason>,
}

impl RoutingDecision {
    pub fn new(
        handler_id: impl Into<String>,
        confidence: f32,
        rationale: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        let rationale = rationale.into();
        Self {
            handler_id: handler_id.into(),
            confidence: clamp_confidence(confidence),
            rationale: if rationale.trim().is_empty() {
                "no rationale given".to_string()
            } else {
                rationale
            },
            strategy: strategy.into(),
            fallback: None,
        }
    }

    /// Retargets to the default handler, keeping the original rationale.
    pub fn fall_back(&self, default_handler: &str, reason: FallbackReason) -> Self {
        Self {
            handler_id: default_handler.to_string(),
            confidence: self.confidence,
            rationale: format!("{}; fallback to '{}': {}", self.rationale, default_handler, reason),
            strategy: self.strategy.clone(),
            fallback: Some(reason),
        }
    }
}

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub handler_id: String,
    pub text: String,
    pub confidence: f32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn succeeded(
        handler_id: impl Into<String>,
        text: impl Into<String>,
        confidence: f32,
        duration: Duration,
    ) -> Self {
        Self {
            handler_id: handler_id.into(),
            text: text.into(),
            confidence: clamp_confidence(confidence),
            duration,
            success: true,
            error: None,
        }
    }

    pub fn failed(handler_id: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            handler_id: handler_id.into(),
            text: String::new(),
            confidence: 0.0,
            duration,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Result of a fan-out across several handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBatchResult {
    /// One entry per requested handler, in request order
    pub responses: Vec<AgentResponse>,
    pub summary: String,
    pub confidences: HashMap<String, f32>,
}

impl ParallelBatchResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &AgentResponse> {
        self.responses.iter().filter(|r| r.success)
    }

    pub fn any_succeeded(&self) -> bool {
        self.responses.iter().any(|r| r.success)
    }
}

/// The part of a response that differs by path. Exactly one variant is carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Answer {
        decision: RoutingDecision,
        response: AgentResponse,
    },
    Batch(ParallelBatchResult),
    Confirmation {
        decision: RoutingDecision,
        envelope: ConfirmationEnvelope,
    },
}

/// Uniform envelope returned from every entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub success: bool,
    pub text: String,
    pub body: ResponseBody,
}

impl RouteResponse {
    pub fn answer(decision: RoutingDecision, response: AgentResponse) -> Self {
        Self {
            success: response.success,
            text: response.text.clone(),
            body: ResponseBody::Answer { decision, response },
        }
    }

    pub fn batch(result: ParallelBatchResult) -> Self {
        Self {
            success: result.any_succeeded(),
            text: result.summary.clone(),
            body: ResponseBody::Batch(result),
        }
    }

    pub fn confirmation(decision: RoutingDecision, envelope: ConfirmationEnvelope) -> Self {
        Self {
            success: true,
            text: envelope.question.clone(),
            body: ResponseBody::Confirmation { decision, envelope },
        }
    }

    pub fn decision(&self) -> Option<&RoutingDecision> {
        match &self.body {
            ResponseBody::Answer { decision, .. } | ResponseBody::Confirmation { decision, .. } => {
                Some(decision)
            }
            ResponseBody::Batch(_) => None,
        }
    }

    pub fn envelope(&self) -> Option<&ConfirmationEnvelope> {
        match &self.body {
            ResponseBody::Confirmation { envelope, .. } => Some(envelope),
            _ => None,
        }
    }

    pub fn is_pending_confirmation(&self) -> bool {
        self.envelope().is_some()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

//! Confirmation gate
//!
//! What this module provides
//! - Detection of confirmation requests embedded in handler answers
//! - Suspension of the turn behind a [`ConfirmationEnvelope`] and exactly-once resumption
//!
//! Exports
//! - Models
//!   - `ConfirmationEnvelope { id, question, options, context, expires_at }`
//!   - `PendingConfirmation` (envelope + session, user and handler bindings + resolution)
//!   - `ConfirmationOutcome::{Accepted { option }, Rejected}`
//! - Traits
//!   - `PendingConfirmationStore` with `put`, `get`, an atomic `resolve` and `purge_expired`
//!   - Implementations: `InMemoryConfirmationStore`, `SqliteConfirmationStore`
//! - Utils
//!   - `ConfirmationGate` tying marker extraction, the store and the TTL together
//!
//! Lifecycle: created → pending in the store → resolved once (accepted, rejected or
//! expired) → discarded by `purge_expired` once past its expiry. Ids are uuid v4
//! and never reused. A resolved, expired or discarded record is never handed out
//! again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConfirmationError, Result, RouterError};

pub mod marker;
pub mod sqlite;

pub use marker::{find_marker, ConfirmationMarker};
pub use sqlite::SqliteConfirmationStore;

/// Replies that decline a pending action, matched on the first word.
pub const REJECTION_WORDS: &[&str] = &["cancel", "no", "reject", "decline", "stop"];
/// Replies that accept the first non-rejecting option when the user does not name one.
const AFFIRMATIVE_WORDS: &[&str] = &["yes", "y", "ok", "okay", "sure", "confirm", "proceed"];

/// What the user sees instead of the handler's answer while a confirmation is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationEnvelope {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    /// Opaque data from the handler, echoed back on follow-up
    pub context: Value,
    pub expires_at: DateTime<Utc>,
}

impl ConfirmationEnvelope {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Accepted,
    Rejected,
    Expired,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Accepted => "accepted",
            Resolution::Rejected => "rejected",
            Resolution::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Resolution::Accepted),
            "rejected" => Some(Resolution::Rejected),
            "expired" => Some(Resolution::Expired),
            _ => None,
        }
    }
}

/// A stored envelope and what it is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub envelope: ConfirmationEnvelope,
    pub session_id: String,
    pub user_id: String,
    /// Handler whose answer carried the marker
    pub origin_handler: String,
    /// Handler invoked when the user accepts
    pub follow_up_handler: String,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Accepted { option: String },
    Rejected,
}

/// Storage for pending confirmations.
///
/// `resolve` must be atomic: of any number of concurrent calls for one id, at most
/// one returns `Ok(true)`.
#[async_trait]
pub trait PendingConfirmationStore: Send + Sync {
    /// Inserts a new record. Ids must be fresh.
    async fn put(&self, pending: PendingConfirmation) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<PendingConfirmation>>;

    /// Marks the record resolved if it is still open. `Ok(false)` means it was
    /// already resolved; an unknown id is a [`ConfirmationError::Unknown`].
    async fn resolve(&self, id: &str, resolution: Resolution) -> Result<bool>;

    /// Deletes every record that expired before `before`, resolved or not.
    /// Returns how many were removed.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize>;
}

fn store_error(message: impl Into<String>) -> RouterError {
    ConfirmationError::Store {
        message: message.into(),
    }
    .into()
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfirmationStore {
    records: Arc<Mutex<HashMap<String, PendingConfirmation>>>,
}

impl InMemoryConfirmationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingConfirmationStore for InMemoryConfirmationStore {
    async fn put(&self, pending: PendingConfirmation) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| store_error("lock poisoned"))?;
        if records.contains_key(&pending.envelope.id) {
            return Err(store_error(format!(
                "confirmation id {} already exists",
                pending.envelope.id
            )));
        }
        records.insert(pending.envelope.id.clone(), pending);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingConfirmation>> {
        let records = self.records.lock().map_err(|_| store_error("lock poisoned"))?;
        Ok(records.get(id).cloned())
    }

    async fn resolve(&self, id: &str, resolution: Resolution) -> Result<bool> {
        let mut records = self.records.lock().map_err(|_| store_error("lock poisoned"))?;
        let record = records.get_mut(id).ok_or_else(|| ConfirmationError::Unknown {
            id: id.to_string(),
        })?;
        if record.resolution.is_some() {
            return Ok(false);
        }
        record.resolution = Some(resolution);
        Ok(true)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().map_err(|_| store_error("lock poisoned"))?;
        let count = records.len();
        records.retain(|_, r| r.envelope.expires_at >= before);
        Ok(count - records.len())
    }
}

/// Who a suspended turn belongs to.
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub handler_id: &'a str,
}

/// A successfully resolved confirmation.
#[derive(Debug, Clone)]
pub struct ResolvedConfirmation {
    pub pending: PendingConfirmation,
    pub outcome: ConfirmationOutcome,
}

#[derive(Clone)]
pub struct ConfirmationGate {
    store: Arc<dyn PendingConfirmationStore>,
    ttl: Duration,
}

impl ConfirmationGate {
    pub fn new(store: Arc<dyn PendingConfirmationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<dyn PendingConfirmationStore> {
        &self.store
    }

    /// Looks for a marker in a handler's answer.
    pub fn inspect(&self, text: &str) -> Option<ConfirmationMarker> {
        find_marker(text)
    }

    /// Mints and stores an envelope for `marker`.
    pub async fn suspend(
        &self,
        marker: &ConfirmationMarker,
        binding: Binding<'_>,
    ) -> Result<ConfirmationEnvelope> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| RouterError::config(format!("confirmation ttl out of range: {e}")))?;
        let envelope = ConfirmationEnvelope {
            id: Uuid::new_v4().to_string(),
            question: marker.question.clone(),
            options: marker.options.clone(),
            context: marker.context.clone(),
            expires_at: now + ttl,
        };
        let follow_up = marker
            .follow_up_handler()
            .unwrap_or(binding.handler_id)
            .to_string();
        self.store
            .put(PendingConfirmation {
                envelope: envelope.clone(),
                session_id: binding.session_id.to_string(),
                user_id: binding.user_id.to_string(),
                origin_handler: binding.handler_id.to_string(),
                follow_up_handler: follow_up,
                created_at: now,
                resolution: None,
            })
            .await?;
        info!(
            confirmation_id = %envelope.id,
            handler = binding.handler_id,
            session_id = binding.session_id,
            "turn suspended for confirmation"
        );
        Ok(envelope)
    }

    /// Discards confirmations that expired before now.
    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired(Utc::now()).await?;
        if purged > 0 {
            debug!(purged, "expired confirmations discarded");
        }
        Ok(purged)
    }

    /// Resolves `id` with the user's reply, exactly once.
    pub async fn resolve(
        &self,
        id: &str,
        user_response: &str,
        session_id: &str,
    ) -> Result<ResolvedConfirmation> {
        let pending = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ConfirmationError::Unknown { id: id.to_string() })?;

        if pending.session_id != session_id {
            warn!(confirmation_id = id, "confirmation resolved from another session");
            return Err(ConfirmationError::SessionMismatch { id: id.to_string() }.into());
        }
        if pending.resolution.is_some() {
            return Err(ConfirmationError::AlreadyResolved { id: id.to_string() }.into());
        }
        if pending.envelope.is_expired_at(Utc::now()) {
            self.store.resolve(id, Resolution::Expired).await?;
            debug!(confirmation_id = id, "confirmation expired");
            return Err(ConfirmationError::Expired { id: id.to_string() }.into());
        }

        let outcome = classify_reply(user_response, &pending.envelope.options)?;
        let resolution = match outcome {
            ConfirmationOutcome::Accepted { .. } => Resolution::Accepted,
            ConfirmationOutcome::Rejected => Resolution::Rejected,
        };
        if !self.store.resolve(id, resolution).await? {
            // lost the race against a concurrent resolution
            return Err(ConfirmationError::AlreadyResolved { id: id.to_string() }.into());
        }
        info!(confirmation_id = id, resolution = resolution.as_str(), "confirmation resolved");
        Ok(ResolvedConfirmation { pending, outcome })
    }
}

fn is_rejection(word: &str) -> bool {
    REJECTION_WORDS.contains(&word)
}

/// Maps a free-text reply onto the offered options.
pub fn classify_reply(
    user_response: &str,
    options: &[String],
) -> std::result::Result<ConfirmationOutcome, ConfirmationError> {
    let normalized = user_response.trim().to_lowercase();
    let words: Vec<&str> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let first = words.first().copied().unwrap_or_default();

    if is_rejection(first) {
        return Ok(ConfirmationOutcome::Rejected);
    }

    let named = options.iter().find(|o| {
        let o = o.to_lowercase();
        o == normalized || words.contains(&o.as_str())
    });
    if let Some(option) = named {
        return Ok(if is_rejection(&option.to_lowercase()) {
            ConfirmationOutcome::Rejected
        } else {
            ConfirmationOutcome::Accepted {
                option: option.clone(),
            }
        });
    }

    if AFFIRMATIVE_WORDS.contains(&first) {
        if let Some(option) = options.iter().find(|o| !is_rejection(&o.to_lowercase())) {
            return Ok(ConfirmationOutcome::Accepted {
                option: option.clone(),
            });
        }
    }

    if options.is_empty() && !normalized.is_empty() {
        return Ok(ConfirmationOutcome::Accepted {
            option: user_response.trim().to_string(),
        });
    }

    Err(ConfirmationError::InvalidOption {
        response: user_response.to_string(),
        options: options.to_vec(),
    })
}

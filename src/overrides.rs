//! Attachment overrides.
//!
//! Rules are checked in a fixed order (image, then voice) before any strategy
//! runs. A match decides the route outright with full confidence.

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::model::{AttachmentKind, RoutingDecision, RoutingRequest};
use crate::registry::AgentRegistry;

pub const STRATEGY_NAME: &str = "override";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    pub kind: AttachmentKind,
    pub handler_id: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentOverride {
    rules: Vec<OverrideRule>,
}

impl AttachmentOverride {
    pub fn new(image_handler: impl Into<String>, voice_handler: impl Into<String>) -> Self {
        Self {
            rules: vec![
                OverrideRule {
                    kind: AttachmentKind::Image,
                    handler_id: image_handler.into(),
                },
                OverrideRule {
                    kind: AttachmentKind::Voice,
                    handler_id: voice_handler.into(),
                },
            ],
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.image_handler.clone(), config.voice_handler.clone())
    }

    pub fn rules(&self) -> &[OverrideRule] {
        &self.rules
    }

    /// Every target must be registered and none may be the default handler.
    pub fn validate(&self, registry: &AgentRegistry) -> Result<()> {
        for rule in &self.rules {
            if !registry.contains(&rule.handler_id) {
                return Err(RouterError::config(format!(
                    "{} override targets unregistered handler '{}'",
                    rule.kind.as_str(),
                    rule.handler_id
                )));
            }
            if rule.handler_id == registry.default_id() {
                return Err(RouterError::config(format!(
                    "{} override cannot target the default handler",
                    rule.kind.as_str()
                )));
            }
        }
        Ok(())
    }

    pub fn apply(&self, request: &RoutingRequest) -> Option<RoutingDecision> {
        let attachment = request.attachment()?;
        self.rules
            .iter()
            .find(|rule| rule.kind == attachment.kind)
            .map(|rule| {
                RoutingDecision::new(
                    rule.handler_id.clone(),
                    1.0,
                    format!(
                        "{} attachment routes to '{}'",
                        attachment.kind.as_str(),
                        rule.handler_id
                    ),
                    STRATEGY_NAME,
                )
            })
    }
}

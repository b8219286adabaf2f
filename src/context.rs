//! # Handler Context Assembly
//!
//! The [`ContextBuilder`] turns a [`RoutingRequest`] into the instruction payload
//! a specialist receives. Sections appear in a fixed order: condensed history,
//! household context, attachment directive, then the current message. Missing
//! optional inputs simply omit their section; building never fails.
//!
//! The attachment directive spells out the attachment kind, its exact reference,
//! and which analysis capability to call with it. Language-model handlers tend to
//! paraphrase or drop references that are only implied, so the directive repeats
//! the reference verbatim.

use std::collections::BTreeMap;

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ContextLimits;
use crate::confirmation::ConfirmationEnvelope;
use crate::error::Result;
use crate::model::{Attachment, AttachmentKind, Role, RoutingRequest, Turn};

/// Capability a handler must call for an image attachment.
pub const IMAGE_CAPABILITY: &str = "analyze_image";
/// Capability a handler must call for a voice attachment.
pub const VOICE_CAPABILITY: &str = "transcribe_voice";

/// One titled block of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum ContextSection {
    History { turns: Vec<Turn> },
    Household { entries: BTreeMap<String, Value> },
    Attachment {
        kind: AttachmentKind,
        reference: String,
        capability: String,
    },
    FollowUp {
        confirmation_id: String,
        question: String,
        user_response: String,
        context: Value,
    },
    Message { text: String },
}

impl ContextSection {
    fn render(&self, out: &mut String) {
        match self {
            ContextSection::History { turns } => {
                out.push_str("## Conversation so far\n");
                for turn in turns {
                    out.push_str(turn.role.label());
                    out.push_str(": ");
                    out.push_str(&turn.content);
                    out.push('\n');
                }
            }
            ContextSection::Household { entries } => {
                out.push_str("## Household context\n");
                for (key, value) in entries {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.push_str(&format!("- {key}: {rendered}\n"));
                }
            }
            ContextSection::Attachment {
                kind,
                reference,
                capability,
            } => {
                out.push_str("## Attachment\n");
                out.push_str(&format!("Kind: {}\n", kind.as_str()));
                out.push_str(&format!("Reference: {reference}\n"));
                out.push_str(&format!(
                    "You MUST call `{capability}` with reference \"{reference}\" exactly as written \
                     before answering. Do not shorten, rename or paraphrase the reference.\n"
                ));
            }
            ContextSection::FollowUp {
                confirmation_id,
                question,
                user_response,
                context,
            } => {
                out.push_str("## Confirmation follow-up\n");
                out.push_str(&format!("Confirmation id: {confirmation_id}\n"));
                out.push_str(&format!("You asked: {question}\n"));
                out.push_str(&format!("The user replied: {user_response}\n"));
                if !context.is_null() {
                    out.push_str(&format!("Pending action context: {context}\n"));
                }
                out.push_str("Carry out the confirmed action and report the result.\n");
            }
            ContextSection::Message { text } => {
                out.push_str("## Current message\n");
                out.push_str(text);
                out.push('\n');
            }
        }
    }
}

/// Structured instruction payload handed to a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub user_id: String,
    pub session_id: String,
    pub sections: Vec<ContextSection>,
}

impl ContextPayload {
    /// Renders every section, in order, into one instruction document.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            section.render(&mut out);
        }
        out
    }

    pub fn attachment(&self) -> Option<(&AttachmentKind, &str)> {
        self.sections.iter().find_map(|s| match s {
            ContextSection::Attachment {
                kind, reference, ..
            } => Some((kind, reference.as_str())),
            _ => None,
        })
    }

    pub fn message(&self) -> Option<&str> {
        self.sections.iter().find_map(|s| match s {
            ContextSection::Message { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Chat messages for a language-model handler: the system prompt, the
    /// prior turns as real messages, then everything else as the final user
    /// message.
    pub fn to_messages(&self, system_prompt: &str) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into(),
        ];

        let mut rest = String::new();
        for section in &self.sections {
            match section {
                ContextSection::History { turns } => {
                    for turn in turns {
                        messages.push(turn_message(turn)?);
                    }
                }
                other => {
                    if !rest.is_empty() {
                        rest.push('\n');
                    }
                    other.render(&mut rest);
                }
            }
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(rest)
                .build()?
                .into(),
        );
        Ok(messages)
    }
}

fn turn_message(turn: &Turn) -> Result<ChatCompletionRequestMessage> {
    let msg = match turn.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(turn.content.as_str())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(turn.content.as_str())
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(turn.content.as_str())
            .build()?
            .into(),
    };
    Ok(msg)
}

/// Pure request → payload transformation.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    limits: ContextLimits,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn build(&self, request: &RoutingRequest) -> ContextPayload {
        let mut sections = Vec::new();

        let history = self.condense(request.history());
        if !history.is_empty() {
            sections.push(ContextSection::History { turns: history });
        }

        if let Some(household) = request.household().filter(|h| !h.is_empty()) {
            sections.push(ContextSection::Household {
                entries: household.clone(),
            });
        }

        if let Some(attachment) = request.attachment() {
            sections.push(attachment_section(attachment));
        }

        if !request.message().trim().is_empty() {
            sections.push(ContextSection::Message {
                text: request.message().to_string(),
            });
        }

        ContextPayload {
            user_id: request.user_id().to_string(),
            session_id: request.session_id().to_string(),
            sections,
        }
    }

    /// Payload for the follow-up of an accepted confirmation.
    pub fn follow_up(
        &self,
        envelope: &ConfirmationEnvelope,
        user_id: &str,
        session_id: &str,
        user_response: &str,
    ) -> ContextPayload {
        ContextPayload {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            sections: vec![ContextSection::FollowUp {
                confirmation_id: envelope.id.clone(),
                question: envelope.question.clone(),
                user_response: user_response.to_string(),
                context: envelope.context.clone(),
            }],
        }
    }

    /// Last `history_turns` turns, each cut to `turn_chars` characters.
    fn condense(&self, history: &[Turn]) -> Vec<Turn> {
        let skip = history.len().saturating_sub(self.limits.history_turns);
        history
            .iter()
            .skip(skip)
            .filter(|t| !t.content.trim().is_empty())
            .map(|t| Turn {
                role: t.role,
                content: truncate_chars(&t.content, self.limits.turn_chars),
            })
            .collect()
    }
}

fn attachment_section(attachment: &Attachment) -> ContextSection {
    let capability = match attachment.kind {
        AttachmentKind::Image => IMAGE_CAPABILITY,
        AttachmentKind::Voice => VOICE_CAPABILITY,
    };
    ContextSection::Attachment {
        kind: attachment.kind,
        reference: attachment.reference.clone(),
        capability: capability.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

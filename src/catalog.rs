//! Built-in household specialist profiles.
//!
//! A profile is the static half of an [`AgentDescriptor`]: id, label, capability
//! tags, prior reliability and the system prompt an [`LlmHandler`] answers under.

use tower::util::BoxCloneSyncService;

use crate::handlers::LlmHandler;
use crate::provider::ModelSvc;
use crate::registry::{AgentDescriptor, ConfidenceClass};

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialistProfile {
    pub id: &'static str,
    pub label: &'static str,
    pub tags: &'static [&'static str],
    pub class: ConfidenceClass,
    pub prompt: &'static str,
}

impl SpecialistProfile {
    /// Descriptor whose handler is a language model answering under this profile's prompt.
    pub fn into_descriptor(&self, provider: ModelSvc, model: &str) -> AgentDescriptor {
        let handler = LlmHandler::new(provider, model, self.prompt).with_confidence(match self.class {
            ConfidenceClass::High => 0.85,
            ConfidenceClass::Medium => 0.7,
            ConfidenceClass::Low => 0.55,
        });
        AgentDescriptor::new(self.id, self.label, BoxCloneSyncService::new(handler))
            .with_tags(self.tags.iter().copied())
            .with_class(self.class)
    }
}

pub const GENERAL: &str = "general";
pub const IMAGE: &str = "image_handler";
pub const VOICE: &str = "voice_handler";

/// The household assistant's specialists. `general` is the fallback generalist;
/// `image_handler` and `voice_handler` are reached through attachment overrides.
pub fn household_specialists() -> Vec<SpecialistProfile> {
    vec![
        SpecialistProfile {
            id: GENERAL,
            label: "General assistant",
            tags: &[],
            class: ConfidenceClass::Medium,
            prompt: "You are a friendly family assistant. Answer general questions and keep replies short.",
        },
        SpecialistProfile {
            id: IMAGE,
            label: "Image analysis",
            tags: &["photo", "picture", "image", "screenshot"],
            class: ConfidenceClass::High,
            prompt: "You analyze images shared by the family. Always call analyze_image with the exact reference you are given.",
        },
        SpecialistProfile {
            id: VOICE,
            label: "Voice notes",
            tags: &["voice", "audio", "recording"],
            class: ConfidenceClass::High,
            prompt: "You handle voice notes. Always call transcribe_voice with the exact reference you are given, then answer.",
        },
        SpecialistProfile {
            id: "health",
            label: "Family health",
            tags: &["health", "doctor", "fever", "cough", "medicine", "symptom", "vaccine", "sick"],
            class: ConfidenceClass::High,
            prompt: "You give cautious, general family health guidance and say when to see a doctor.",
        },
        SpecialistProfile {
            id: "nutrition",
            label: "Nutrition and meals",
            tags: &["recipe", "meal", "cook", "dinner", "lunch", "breakfast", "diet", "nutrition", "allergy"],
            class: ConfidenceClass::Medium,
            prompt: "You plan meals and recipes that respect the household's dietary needs.",
        },
        SpecialistProfile {
            id: "education",
            label: "Learning and homework",
            tags: &["homework", "school", "math", "reading", "exam", "tutor", "study"],
            class: ConfidenceClass::Medium,
            prompt: "You help children and parents with schoolwork without simply giving away answers.",
        },
        SpecialistProfile {
            id: "finance",
            label: "Household budget",
            tags: &["budget", "money", "savings", "expense", "bill", "allowance", "tax"],
            class: ConfidenceClass::Medium,
            prompt: "You help the family track spending and plan a budget.",
        },
        SpecialistProfile {
            id: "schedule",
            label: "Family calendar",
            tags: &["schedule", "calendar", "appointment", "remind", "reminder", "meeting", "pickup"],
            class: ConfidenceClass::High,
            prompt: "You manage the family calendar. Ask for confirmation before creating or changing events.",
        },
        SpecialistProfile {
            id: "travel",
            label: "Trips and outings",
            tags: &["travel", "trip", "vacation", "flight", "hotel", "holiday", "outing"],
            class: ConfidenceClass::Medium,
            prompt: "You plan family trips and day outings.",
        },
        SpecialistProfile {
            id: "shopping",
            label: "Shopping lists",
            tags: &["shopping", "groceries", "buy", "store", "order"],
            class: ConfidenceClass::Medium,
            prompt: "You maintain shopping lists. Ask for confirmation before placing orders.",
        },
        SpecialistProfile {
            id: "home",
            label: "Home maintenance",
            tags: &["repair", "leak", "cleaning", "chores", "garden", "plumbing", "appliance"],
            class: ConfidenceClass::Low,
            prompt: "You help with chores, cleaning routines and small home repairs.",
        },
        SpecialistProfile {
            id: "pets",
            label: "Pet care",
            tags: &["pet", "dog", "cat", "vet", "puppy", "kitten"],
            class: ConfidenceClass::Medium,
            prompt: "You give pet care advice and suggest a vet when needed.",
        },
        SpecialistProfile {
            id: "parenting",
            label: "Parenting",
            tags: &["toddler", "baby", "tantrum", "bedtime", "parenting", "screen time"],
            class: ConfidenceClass::Medium,
            prompt: "You offer practical, warm parenting advice.",
        },
        SpecialistProfile {
            id: "elder_care",
            label: "Elder care",
            tags: &["grandma", "grandpa", "elderly", "care home", "mobility"],
            class: ConfidenceClass::Low,
            prompt: "You support families caring for older relatives.",
        },
        SpecialistProfile {
            id: "wellbeing",
            label: "Emotional wellbeing",
            tags: &["stress", "anxious", "sad", "lonely", "argument", "feelings"],
            class: ConfidenceClass::Low,
            prompt: "You listen with empathy and suggest gentle, practical next steps.",
        },
    ]
}

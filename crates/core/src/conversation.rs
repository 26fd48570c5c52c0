//! Conversation domain types.
//!
//! A conversation is an ordered sequence of role-tagged turns: an optional
//! system directive first, then user/assistant turns alternating in temporal
//! order. The gateway receives the history portion over the wire; the engine
//! prepends the language-appropriate directive and appends the new user
//! message before prompting the model.

use serde::{Deserialize, Serialize};

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (identity, rules, reply language)
    System,
    /// The end user
    User,
    /// The model's reply
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        write!(f, "{s}")
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who authored this turn
    pub role: Role,

    /// The text content (non-empty for valid turns)
    pub content: String,
}

impl ConversationTurn {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// The reply language a caller selects per request.
///
/// Exactly two variants are supported and the choice is explicit — there is
/// no detection heuristic. The wire values match the original service
/// contract: `"id"` (Indonesian, the primary deployment language) and
/// `"en"` (English).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Bahasa Indonesia — the default when the selector is omitted
    #[default]
    Id,
    /// English
    En,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Language::Id => "id",
            Language::En => "en",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_constructors_set_roles() {
        assert_eq!(ConversationTurn::user("halo").role, Role::User);
        assert_eq!(ConversationTurn::assistant("hi").role, Role::Assistant);
        assert_eq!(ConversationTurn::system("rules").role, Role::System);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(back, Role::User);
    }

    #[test]
    fn language_wire_values() {
        assert_eq!(serde_json::to_string(&Language::Id).unwrap(), "\"id\"");
        assert_eq!(serde_json::to_string(&Language::En).unwrap(), "\"en\"");
        let back: Language = serde_json::from_str("\"en\"").unwrap();
        assert_eq!(back, Language::En);
    }

    #[test]
    fn language_defaults_to_indonesian() {
        assert_eq!(Language::default(), Language::Id);
    }

    #[test]
    fn turn_serialization_roundtrip() {
        let turn = ConversationTurn::user("Apa kabar?");
        let json = serde_json::to_string(&turn).unwrap();
        let back: ConversationTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }
}

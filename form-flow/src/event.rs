//! Typed events coming in from the transport and prompts going back out.
//!
//! The transport parses its wire payloads exactly once into an [`Event`]; the
//! engine never splits or re-parses opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the user owning a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Raw upload as received by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    pub file_name: String,
    pub source: FileSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    /// Payload already downloaded by the transport
    Bytes(Vec<u8>),
    /// Transport-side handle (e.g. a chat platform file id) resolved lazily
    Handle(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Text(String),
    /// Id of the chosen option
    Selection(String),
    File(FileUpload),
    /// Command name without the leading slash
    Command(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub owner_id: OwnerId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(owner_id: impl Into<OwnerId>, kind: EventKind) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind,
        }
    }

    /// Builds an event from free chat text, turning `/name args` into a command
    pub fn from_text(owner_id: impl Into<OwnerId>, text: &str) -> Self {
        let kind = match parse_command(text) {
            Some(name) => EventKind::Command(name.to_string()),
            None => EventKind::Text(text.to_string()),
        };
        Self::new(owner_id, kind)
    }

    pub fn selection(owner_id: impl Into<OwnerId>, id: impl Into<String>) -> Self {
        Self::new(owner_id, EventKind::Selection(id.into()))
    }

    pub fn command(owner_id: impl Into<OwnerId>, name: impl Into<String>) -> Self {
        Self::new(owner_id, EventKind::Command(name.into()))
    }

    pub fn file(owner_id: impl Into<OwnerId>, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(
            owner_id,
            EventKind::File(FileUpload {
                file_name: file_name.into(),
                source: FileSource::Bytes(bytes),
            }),
        )
    }

    /// Command name if this event is (or spells out) a slash command
    pub fn command_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Command(name) => Some(name.trim_start_matches('/')),
            EventKind::Text(text) => parse_command(text),
            _ => None,
        }
    }
}

fn parse_command(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix('/')?;
    let name = rest.split_whitespace().next()?;
    // `/done@SomeBot` style suffixes are stripped
    let name = name.split('@').next().unwrap_or(name);
    (!name.is_empty()).then_some(name)
}

/// Selectable option rendered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
}

/// Outbound message for the transport to render
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            choices: Vec::new(),
        }
    }

    pub fn with_choices(text: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            text: text.into(),
            choices,
        }
    }
}

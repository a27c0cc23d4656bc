use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Free-form key/value payload for properties, traits and context
pub type Properties = serde_json::Map<String, serde_json::Value>;

pub const LIBRARY_NAME: &str = "expa-analytics";
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kind of analytics message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Identify,
    Track,
    Screen,
    Group,
    Alias,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Identify => "identify",
            MessageType::Track => "track",
            MessageType::Screen => "screen",
            MessageType::Group => "group",
            MessageType::Alias => "alias",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who an event is attributed to.
///
/// Both ids travel with every message. When both are present the user id is
/// the distinct id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Identity {
    pub fn new(anonymous_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            anonymous_id,
            user_id,
        }
    }

    pub fn distinct_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.anonymous_id.as_deref())
    }
}

/// A single analytics message as it goes over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Track event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Screen name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,

    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub traits: Properties,

    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub context: Properties,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Message {
    /// Create a message of the given type attributed to `identity`.
    pub fn new(message_type: MessageType, identity: &Identity) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type,
            anonymous_id: identity.anonymous_id.clone(),
            user_id: identity.user_id.clone(),
            event: None,
            name: None,
            group_id: None,
            previous_id: None,
            properties: Properties::new(),
            traits: Properties::new(),
            context: Properties::new(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn identify(identity: &Identity, traits: Properties) -> Self {
        Self {
            traits,
            ..Self::new(MessageType::Identify, identity)
        }
    }

    pub fn track(identity: &Identity, event: impl Into<String>, properties: Properties) -> Self {
        Self {
            event: Some(event.into()),
            properties,
            ..Self::new(MessageType::Track, identity)
        }
    }

    pub fn screen(identity: &Identity, name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: Some(name.into()),
            properties,
            ..Self::new(MessageType::Screen, identity)
        }
    }

    pub fn group(identity: &Identity, group_id: impl Into<String>, traits: Properties) -> Self {
        Self {
            group_id: Some(group_id.into()),
            traits,
            ..Self::new(MessageType::Group, identity)
        }
    }

    /// `identity` is the identity after aliasing; `previous_id` the distinct id before it.
    pub fn alias(identity: &Identity, previous_id: Option<String>) -> Self {
        Self {
            previous_id,
            ..Self::new(MessageType::Alias, identity)
        }
    }

    pub fn with_context(mut self, context: Properties) -> Self {
        self.context = context;
        self
    }
}

/// Request body carrying several messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch: Vec<Message>,

    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,

    pub context: Properties,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            batch: messages,
            sent_at: OffsetDateTime::now_utc(),
            context: library_context(),
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.batch.iter().map(|m| m.message_id.clone()).collect()
    }
}

fn library_context() -> Properties {
    let mut context = Properties::new();
    context.insert(
        "library".to_string(),
        serde_json::json!({ "name": LIBRARY_NAME, "version": LIBRARY_VERSION }),
    );
    context
}

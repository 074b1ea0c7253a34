use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported messaging channels (kept small and stable).
///
/// ```
/// use ucm_core::ChannelType;
///
/// let c = ChannelType::WhatsApp;
/// assert_eq!(c.as_str(), "whatsapp");
/// assert_eq!("instagram".parse::<ChannelType>().unwrap(), ChannelType::Instagram);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    WhatsApp,
    Instagram,
    Facebook,
    WebChat,
}

impl ChannelType {
    /// Lowercase identifier used in routes, dedup keys, and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::WhatsApp => "whatsapp",
            ChannelType::Instagram => "instagram",
            ChannelType::Facebook => "facebook",
            ChannelType::WebChat => "webchat",
        }
    }
}

impl Display for ChannelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(ChannelType::WhatsApp),
            "instagram" => Ok(ChannelType::Instagram),
            "facebook" => Ok(ChannelType::Facebook),
            "webchat" => Ok(ChannelType::WebChat),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

/// Message direction, derived from payload shape, never guessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery status of an outbound message.
///
/// Transitions move forward only: `sent -> delivered -> read`, or into
/// `failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal status transition.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Sent, Delivered) | (Sent, Read) | (Delivered, Read) => true,
            (Sent, Failed) | (Delivered, Failed) => true,
            _ => false,
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Canonical cross-provider message record.
///
/// `external_id` is the provider's stable event/message id and doubles as the
/// dedup key together with `channel`. `channel_identifier` is the value the
/// account router resolves for the channel (a WhatsApp phone-number id, a
/// page id, a widget id).
///
/// ```
/// use ucm_core::{ChannelType, Direction, UnifiedMessage};
///
/// let msg = UnifiedMessage::inbound(
///     ChannelType::WhatsApp,
///     "966520989876579",
///     "wamid.ABC123",
///     "15551234567",
///     "966520989876579",
/// )
/// .with_text("Hola");
/// assert_eq!(msg.direction, Direction::Inbound);
/// assert_eq!(msg.dedup_suffix(), "wamid.ABC123");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnifiedMessage {
    pub external_id: String,
    pub channel: ChannelType,
    pub channel_identifier: String,
    pub direction: Direction,
    pub from: String,
    pub to: String,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub timestamp: String, // ISO-8601
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub conversation_external_id: Option<String>,
    pub contact_name: Option<String>,
    pub status: Option<DeliveryStatus>,
}

impl UnifiedMessage {
    pub fn inbound(
        channel: ChannelType,
        channel_identifier: impl Into<String>,
        external_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(channel, channel_identifier, external_id, from, to, Direction::Inbound)
    }

    pub fn outbound(
        channel: ChannelType,
        channel_identifier: impl Into<String>,
        external_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(channel, channel_identifier, external_id, from, to, Direction::Outbound)
    }

    fn new(
        channel: ChannelType,
        channel_identifier: impl Into<String>,
        external_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            channel,
            channel_identifier: channel_identifier.into(),
            direction,
            from: from.into(),
            to: to.into(),
            text: None,
            media_url: None,
            media_type: None,
            timestamp: crate::now_rfc3339(),
            metadata: BTreeMap::new(),
            conversation_external_id: None,
            contact_name: None,
            status: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_media(mut self, url: impl Into<String>, media_type: impl Into<String>) -> Self {
        self.media_url = Some(url.into());
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// The channel-local half of the dedup key.
    pub fn dedup_suffix(&self) -> &str {
        &self.external_id
    }
}

/// Outbound send request. Not persisted by this layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutgoingMessage {
    pub to: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl OutgoingMessage {
    pub fn text(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_round_trips_through_str() {
        for channel in [
            ChannelType::WhatsApp,
            ChannelType::Instagram,
            ChannelType::Facebook,
            ChannelType::WebChat,
        ] {
            assert_eq!(channel.as_str().parse::<ChannelType>().unwrap(), channel);
        }
        assert!("telegram".parse::<ChannelType>().is_err());
    }

    #[test]
    fn delivery_status_transitions_move_forward_only() {
        use DeliveryStatus::*;
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Sent.can_transition_to(Failed));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Sent));
    }

    #[test]
    fn unified_message_builder_sets_direction_and_text() {
        let msg = UnifiedMessage::inbound(
            ChannelType::WebChat,
            "widget-1",
            "wc-42",
            "visitor-9",
            "widget-1",
        )
        .with_text("hello")
        .with_media("https://cdn.example/img.png", "image/png");
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.media_type.as_deref(), Some("image/png"));
        assert!(msg.status.is_none());
    }
}

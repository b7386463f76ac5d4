use serde::{Deserialize, Serialize};

/// Opaque message content handed through to the downstream processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    Media {
        mime_type: String,
        /// Where the channel client stored the downloaded media.
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text body, or the caption for media messages.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Media { caption, .. } => caption.as_deref(),
        }
    }
}

/// A decoded message event delivered by the messaging-channel client.
///
/// `external_id` is assigned by the channel and repeats when the channel
/// redelivers the same message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub external_id: String,
    pub sender_id: String,
    pub payload: MessagePayload,
    pub received_at_ms: u64,
}

impl InboundEvent {
    pub fn text(
        external_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            sender_id: sender_id.into(),
            payload: MessagePayload::text(text),
            received_at_ms: crate::now_ms(),
        }
    }

    /// Sender identity in its normalised form.
    pub fn sender(&self) -> String {
        normalize_sender(&self.sender_id)
    }
}

/// Normalise a phone-like sender identity.
///
/// Channel addresses such as `5511987654321:7@s.whatsapp.net` or
/// `+55 (11) 98765-4321` both become `5511987654321`. Anything whose user part
/// is not shaped like a phone number is lower-cased and trimmed instead, so
/// `alice123@x` and `bob123@y` stay distinct.
pub fn normalize_sender(raw: &str) -> String {
    let user = raw.split('@').next().unwrap_or(raw);
    let user = user.split(':').next().unwrap_or(user).trim();
    let phone_shaped = user.chars().any(|c| c.is_ascii_digit())
        && user
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '(' | ')' | '-'));
    if phone_shaped {
        user.chars().filter(char::is_ascii_digit).collect()
    } else {
        raw.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("5511987654321@s.whatsapp.net", "5511987654321")]
    #[case("5511987654321:7@s.whatsapp.net", "5511987654321")]
    #[case("+55 (11) 98765-4321", "5511987654321")]
    #[case("5511987654321", "5511987654321")]
    #[case("  Support-Desk ", "support-desk")]
    #[case("alice123@x", "alice123@x")]
    #[case("Bob123@Y", "bob123@y")]
    #[case("+1 555-0100@sms", "15550100")]
    fn normalizes_sender(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_sender(raw), expected);
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let json = serde_json::to_value(MessagePayload::text("oi")).unwrap_or_default();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "oi");
    }

    #[test]
    fn media_caption_is_text() {
        let payload = MessagePayload::Media {
            mime_type: "image/jpeg".into(),
            location: "/tmp/a.jpg".into(),
            caption: Some("look".into()),
        };
        assert_eq!(payload.as_text(), Some("look"));
    }
}

use crate::types::{ConversationKey, GatewayEnvelope, InboundEvent};
use chrono::{DateTime, TimeZone, Utc};

const MEDIA_BODY_PLACEHOLDER: &str = "[media message]";

/// Canonicalize a counterpart address into one conversation key.
///
/// Gateways hand out the same counterpart in several spellings: a bare
/// E.164-ish number ("+1 555-123-4567"), a suffixed direct identifier
/// ("15551234567@c.gw"), or an opaque alias ("group:ops-desk"). The rules:
///
/// - strip a trailing "@<domain>" routing suffix;
/// - numeric addresses keep digits only (punctuation and "+" dropped);
/// - non-numeric addresses are trimmed and lowercased.
///
/// The result is deterministic and idempotent: normalizing an already
/// normalized key returns it unchanged.
pub fn normalize_conversation_key(raw: &str) -> ConversationKey {
    let trimmed = raw.trim();
    let without_suffix = match trimmed.split_once('@') {
        Some((local, _domain)) => local,
        None => trimmed,
    };

    let digits: String = without_suffix
        .chars()
        .filter(|ch| ch.is_ascii_digit())
        .collect();
    let has_letters = without_suffix.chars().any(|ch| ch.is_ascii_alphabetic());

    if !digits.is_empty() && !has_letters {
        return ConversationKey::new(digits);
    }
    ConversationKey::new(without_suffix.trim().to_ascii_lowercase())
}

/// Convert a raw gateway envelope into an [`InboundEvent`].
///
/// Returns `None` for events the adapter drops at the boundary: self-sent
/// echoes of outbound traffic, envelopes without a usable sender address,
/// and empty-body non-media messages.
pub fn normalize_envelope(gateway_id: &str, envelope: &GatewayEnvelope) -> Option<InboundEvent> {
    if envelope.from_me.unwrap_or(false) {
        return None;
    }

    let sender = envelope.from.as_deref().map(str::trim).unwrap_or_default();
    if sender.is_empty() {
        return None;
    }

    let has_media = envelope.has_media.unwrap_or(false);
    let body = envelope.body.as_deref().map(str::trim).unwrap_or_default();
    let body = if body.is_empty() {
        if !has_media {
            return None;
        }
        MEDIA_BODY_PLACEHOLDER.to_string()
    } else {
        body.to_string()
    };

    let conversation_key = normalize_conversation_key(sender);
    let gateway_timestamp = envelope.timestamp_ms.and_then(millis_to_datetime);
    let observed_at = Utc::now();

    let message_id = envelope
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| {
            let ts = envelope
                .timestamp_ms
                .unwrap_or_else(|| observed_at.timestamp_millis());
            format!("{gateway_id}:{conversation_key}:{ts}")
        });

    Some(InboundEvent {
        message_id: message_id.into(),
        conversation_key,
        sender_display_name: envelope
            .notify_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned),
        body,
        has_media,
        observed_at,
        gateway_timestamp,
        source_gateway_id: gateway_id.into(),
    })
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::{normalize_conversation_key, normalize_envelope};
    use crate::types::GatewayEnvelope;

    #[test]
    fn conversation_key_collapses_address_spellings() {
        let direct = normalize_conversation_key("15551234567@c.gw");
        let pretty = normalize_conversation_key("+1 (555) 123-4567");
        let bare = normalize_conversation_key("15551234567");
        assert_eq!(direct, pretty);
        assert_eq!(direct, bare);
        assert_eq!(direct.as_str(), "15551234567");
    }

    #[test]
    fn conversation_key_normalization_is_idempotent() {
        let once = normalize_conversation_key("+1 555 123 4567");
        let twice = normalize_conversation_key(once.as_str());
        assert_eq!(once, twice);

        let alias_once = normalize_conversation_key("Group:Ops-Desk@chat.gw");
        let alias_twice = normalize_conversation_key(alias_once.as_str());
        assert_eq!(alias_once, alias_twice);
        assert_eq!(alias_once.as_str(), "group:ops-desk");
    }

    #[test]
    fn self_sent_and_empty_envelopes_are_dropped() {
        let echo = GatewayEnvelope {
            id: Some("m1".to_string()),
            from: Some("15551234567".to_string()),
            body: Some("hello".to_string()),
            from_me: Some(true),
            ..GatewayEnvelope::default()
        };
        assert!(normalize_envelope("gw", &echo).is_none());

        let empty = GatewayEnvelope {
            id: Some("m2".to_string()),
            from: Some("15551234567".to_string()),
            body: Some("   ".to_string()),
            ..GatewayEnvelope::default()
        };
        assert!(normalize_envelope("gw", &empty).is_none());

        let no_sender = GatewayEnvelope {
            id: Some("m3".to_string()),
            body: Some("hello".to_string()),
            ..GatewayEnvelope::default()
        };
        assert!(normalize_envelope("gw", &no_sender).is_none());
    }

    #[test]
    fn empty_body_media_message_gets_placeholder() {
        let media = GatewayEnvelope {
            id: Some("m4".to_string()),
            from: Some("15551234567".to_string()),
            has_media: Some(true),
            ..GatewayEnvelope::default()
        };
        let event = normalize_envelope("gw", &media).expect("media event should survive");
        assert!(event.has_media);
        assert_eq!(event.body, "[media message]");
    }

    #[test]
    fn missing_identifier_is_synthesized_deterministically() {
        let envelope = GatewayEnvelope {
            from: Some("15551234567@c.gw".to_string()),
            body: Some("hello".to_string()),
            timestamp_ms: Some(1_700_000_000_000),
            ..GatewayEnvelope::default()
        };
        let event = normalize_envelope("gw", &envelope).expect("event should normalize");
        assert_eq!(event.message_id.as_str(), "gw:15551234567:1700000000000");
        assert_eq!(event.conversation_key.as_str(), "15551234567");
    }
}

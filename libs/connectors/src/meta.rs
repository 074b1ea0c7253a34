//! Shared pieces of the Meta-backed connectors: page asset listing and the
//! messenger webhook shape, which Facebook and Instagram both use.

use serde_json::Value;

use ucm_core::{ChannelType, DeliveryStatus, UnifiedMessage};

/// One page-backed asset the authorizing user can bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAsset {
    pub page_id: String,
    pub name: String,
    pub page_token: String,
    pub instagram_account: Option<InstagramAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstagramAccount {
    pub id: String,
    pub username: String,
}

/// Parses a `/me/accounts` response. Entries missing an id or token are
/// skipped rather than failing the listing.
pub fn parse_page_assets(response: &Value) -> Vec<PageAsset> {
    let Some(data) = response.get("data").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|entry| {
            let page_id = entry.get("id")?.as_str()?.to_string();
            let page_token = entry.get("access_token")?.as_str()?.to_string();
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let instagram_account = entry
                .get("instagram_business_account")
                .and_then(|ig| {
                    Some(InstagramAccount {
                        id: ig.get("id")?.as_str()?.to_string(),
                        username: ig
                            .get("username")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                });
            Some(PageAsset {
                page_id,
                name,
                page_token,
                instagram_account,
            })
        })
        .collect()
}

/// Normalizes a messenger-shaped webhook (`object` of `page` or
/// `instagram`). `channel_identifier` is the entry id: the page id on
/// Facebook, the professional-account id on Instagram.
pub fn normalize_messaging(
    payload: &Value,
    expected_object: &str,
    channel: ChannelType,
) -> Vec<UnifiedMessage> {
    let mut out = Vec::new();
    if payload.get("object").and_then(|v| v.as_str()) != Some(expected_object) {
        return out;
    }
    let Some(entries) = payload.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };

    for entry in entries {
        let Some(channel_identifier) = entry.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(events) = entry.get("messaging").and_then(|v| v.as_array()) else {
            continue;
        };
        for event in events {
            let Some(sender) = event.pointer("/sender/id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(recipient) = event.pointer("/recipient/id").and_then(|v| v.as_str()) else {
                continue;
            };
            // Messenger timestamps are epoch milliseconds.
            let timestamp = event
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .map(|ms| ucm_core::unix_str_to_rfc3339(&(ms / 1000).to_string()))
                .unwrap_or_else(ucm_core::now_rfc3339);

            if let Some(message) = event.get("message") {
                if let Some(msg) =
                    message_from_event(channel, channel_identifier, sender, recipient, message)
                {
                    out.push(msg.with_timestamp(timestamp));
                }
                continue;
            }

            if let Some(delivery) = event.get("delivery") {
                let Some(mids) = delivery.get("mids").and_then(|v| v.as_array()) else {
                    continue;
                };
                for mid in mids.iter().filter_map(|v| v.as_str()) {
                    let mut update = UnifiedMessage::outbound(
                        channel,
                        channel_identifier,
                        format!("{mid}#delivered"),
                        recipient,
                        sender,
                    )
                    .with_timestamp(timestamp.clone());
                    update.status = Some(DeliveryStatus::Delivered);
                    update
                        .metadata
                        .insert("status_for".into(), Value::String(mid.to_string()));
                    out.push(update);
                }
                continue;
            }

            // Read receipts carry only a watermark, postbacks and reactions
            // are not modeled: skip without failing the batch.
        }
    }
    out
}

fn message_from_event(
    channel: ChannelType,
    channel_identifier: &str,
    sender: &str,
    recipient: &str,
    message: &Value,
) -> Option<UnifiedMessage> {
    let mid = message.get("mid")?.as_str()?;
    let is_echo = message
        .get("is_echo")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // An echo is the business side of the conversation, confirmed by the
    // provider; direction comes from the payload, never guessed.
    let mut msg = if is_echo {
        UnifiedMessage::outbound(channel, channel_identifier, mid, sender, recipient)
    } else {
        UnifiedMessage::inbound(channel, channel_identifier, mid, sender, recipient)
    };

    if let Some(text) = message.get("text").and_then(|v| v.as_str()) {
        msg.text = Some(text.to_string());
    }
    if let Some(attachment) = message
        .pointer("/attachments/0")
        .filter(|a| a.pointer("/payload/url").is_some())
    {
        let url = attachment.pointer("/payload/url")?.as_str()?.to_string();
        let kind = attachment
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("file")
            .to_string();
        msg.media_url = Some(url);
        msg.media_type = Some(kind);
    }
    if msg.text.is_none() && msg.media_url.is_none() {
        // Sticker-only or otherwise unmodeled message subtypes.
        return None;
    }
    if let Some(reply) = message.pointer("/reply_to/mid").and_then(|v| v.as_str()) {
        msg.metadata
            .insert("reply_to".into(), Value::String(reply.to_string()));
    }
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ucm_core::Direction;

    #[test]
    fn parses_page_assets_and_skips_incomplete_entries() {
        let response = json!({
            "data": [
                { "id": "page-1", "name": "Acme", "access_token": "tok-1" },
                { "id": "page-2", "name": "No Token" },
                {
                    "id": "page-3",
                    "name": "With IG",
                    "access_token": "tok-3",
                    "instagram_business_account": { "id": "ig-3", "username": "acme_ig" }
                }
            ]
        });
        let assets = parse_page_assets(&response);
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].page_id, "page-1");
        assert_eq!(
            assets[1].instagram_account.as_ref().unwrap().id,
            "ig-3"
        );
    }

    #[test]
    fn inbound_text_message_is_normalized() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "user-77" },
                    "recipient": { "id": "page-1" },
                    "timestamp": 1700000000000i64,
                    "message": { "mid": "mid.abc", "text": "hi there" }
                }]
            }]
        });
        let msgs = normalize_messaging(&payload, "page", ChannelType::Facebook);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].external_id, "mid.abc");
        assert_eq!(msgs[0].direction, Direction::Inbound);
        assert_eq!(msgs[0].channel_identifier, "page-1");
        assert_eq!(msgs[0].text.as_deref(), Some("hi there"));
        assert_eq!(msgs[0].timestamp, "2023-11-14T22:13:20Z");
    }

    #[test]
    fn echo_messages_are_outbound() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "page-1" },
                    "recipient": { "id": "user-77" },
                    "timestamp": 1700000000000i64,
                    "message": { "mid": "mid.echo", "text": "thanks!", "is_echo": true }
                }]
            }]
        });
        let msgs = normalize_messaging(&payload, "page", ChannelType::Facebook);
        assert_eq!(msgs[0].direction, Direction::Outbound);
    }

    #[test]
    fn wrong_object_and_unknown_events_yield_nothing() {
        let wrong = json!({ "object": "instagram", "entry": [] });
        assert!(normalize_messaging(&wrong, "page", ChannelType::Facebook).is_empty());

        let postback = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "user-77" },
                    "recipient": { "id": "page-1" },
                    "postback": { "payload": "GET_STARTED" }
                }]
            }]
        });
        assert!(normalize_messaging(&postback, "page", ChannelType::Facebook).is_empty());
    }

    #[test]
    fn delivery_receipts_become_status_updates() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "user-77" },
                    "recipient": { "id": "page-1" },
                    "timestamp": 1700000000000i64,
                    "delivery": { "mids": ["mid.out1"], "watermark": 1700000000000i64 }
                }]
            }]
        });
        let msgs = normalize_messaging(&payload, "page", ChannelType::Facebook);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].external_id, "mid.out1#delivered");
        assert_eq!(msgs[0].status, Some(DeliveryStatus::Delivered));
        assert_eq!(msgs[0].direction, Direction::Outbound);
    }

    #[test]
    fn media_attachment_is_passed_through() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "user-77" },
                    "recipient": { "id": "page-1" },
                    "message": {
                        "mid": "mid.img",
                        "attachments": [{ "type": "image", "payload": { "url": "https://cdn.fb/img.png" } }]
                    }
                }]
            }]
        });
        let msgs = normalize_messaging(&payload, "page", ChannelType::Facebook);
        assert_eq!(msgs[0].media_url.as_deref(), Some("https://cdn.fb/img.png"));
        assert_eq!(msgs[0].media_type.as_deref(), Some("image"));
    }
}

//! Sample provider payloads shared by connector unit tests and the gateway
//! end-to-end tests.

use serde_json::{Value, json};

/// A WhatsApp Cloud API webhook delivering one inbound text message. The
/// contact profile carries the display name "Ana".
pub fn sample_whatsapp_text(
    phone_number_id: &str,
    external_id: &str,
    from: &str,
    text: &str,
) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "waba-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {
                        "display_phone_number": "+966 52 098 9876",
                        "phone_number_id": phone_number_id
                    },
                    "contacts": [{
                        "wa_id": from,
                        "profile": { "name": "Ana" }
                    }],
                    "messages": [{
                        "id": external_id,
                        "from": from,
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    })
}

/// A messenger-shaped webhook (`object: page`) with one inbound text.
pub fn sample_messenger_text(page_id: &str, mid: &str, sender: &str, text: &str) -> Value {
    json!({
        "object": "page",
        "entry": [{
            "id": page_id,
            "time": 1700000000000i64,
            "messaging": [{
                "sender": { "id": sender },
                "recipient": { "id": page_id },
                "timestamp": 1700000000000i64,
                "message": { "mid": mid, "text": text }
            }]
        }]
    })
}

/// A web chat widget post with one visitor message.
pub fn sample_webchat_text(widget_id: &str, message_id: &str, session_id: &str, text: &str) -> Value {
    json!({
        "widget_id": widget_id,
        "message_id": message_id,
        "session_id": session_id,
        "text": text,
        "sender": { "id": session_id, "name": "Ana" },
        "timestamp": 1700000000
    })
}

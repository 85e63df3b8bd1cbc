use serde_json::Value;

use crate::{ChatMessage, InboundEvent, OutboundMessage, SenderType, TransportError};

const ENVELOPE_KEYS: [&str; 3] = ["data", "payload", "message"];

/// Serialize an outbound chat message into a text frame.
pub fn encode_outbound(
    chat_id: &str,
    content: &str,
    sender_type: &SenderType,
) -> Result<String, TransportError> {
    let message = OutboundMessage {
        chat_id: chat_id.to_string(),
        content: content.to_string(),
        sender_type: sender_type.clone(),
    };
    Ok(serde_json::to_string(&message)?)
}

/// Decode one inbound text frame.
///
/// Only text that is not JSON at all is an error; well-formed JSON the client
/// does not understand comes back as [`InboundEvent::Unrecognized`].
pub fn decode_inbound(text: &str) -> Result<InboundEvent, TransportError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;

    if let Some(message) = server_error_message(&value) {
        return Ok(InboundEvent::Error(message));
    }

    if let Some(message) = chat_message(&value) {
        return Ok(InboundEvent::Message(message));
    }

    // Some backends wrap the message: {"type": "message", "data": {...}}
    if let Some(object) = value.as_object() {
        for key in ENVELOPE_KEYS {
            if let Some(message) = object.get(key).and_then(chat_message) {
                return Ok(InboundEvent::Message(message));
            }
        }
    }

    Ok(InboundEvent::Unrecognized(value))
}

fn server_error_message(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let kind = object.get("type")?.as_str()?;
    if !kind.eq_ignore_ascii_case("error") {
        return None;
    }

    let message = ["message", "error", "detail"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string());
    Some(message)
}

fn chat_message(value: &Value) -> Option<ChatMessage> {
    if !value.get("content").is_some_and(Value::is_string) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_shape() {
        let frame = encode_outbound("chat-1", "hi", &SenderType::User).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"chatId": "chat-1", "content": "hi", "senderType": "USER"}));

        let frame = encode_outbound("chat-2", "take with food", &SenderType::Doctor).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["senderType"], "DOCTOR");
    }

    #[test]
    fn test_decode_plain_message() {
        let event = decode_inbound(r#"{"chatId":"chat-1","content":"hello","senderType":"DOCTOR"}"#)
            .unwrap();
        assert_matches!(event, InboundEvent::Message(m) if m.content == "hello"
            && m.sender_type == Some(SenderType::Doctor));
    }

    #[test]
    fn test_decode_wrapped_message() {
        let event = decode_inbound(
            r#"{"type":"message","data":{"chatId":"chat-1","content":"wrapped"}}"#,
        )
        .unwrap();
        assert_matches!(event, InboundEvent::Message(m) if m.content == "wrapped");
    }

    #[test]
    fn test_decode_server_error() {
        let event = decode_inbound(r#"{"type":"error","message":"chat not found"}"#).unwrap();
        assert_eq!(event, InboundEvent::Error("chat not found".to_string()));

        let event = decode_inbound(r#"{"type":"ERROR"}"#).unwrap();
        assert_matches!(event, InboundEvent::Error(_));
    }

    #[test]
    fn test_decode_unrecognized_json() {
        let event = decode_inbound(r#"{"type":"typing","userId":"u-1"}"#).unwrap();
        assert_matches!(event, InboundEvent::Unrecognized(_));

        let event = decode_inbound("[1,2,3]").unwrap();
        assert_matches!(event, InboundEvent::Unrecognized(_));
    }

    #[test]
    fn test_decode_malformed() {
        assert_matches!(decode_inbound("not json"), Err(TransportError::Decode(_)));
        assert_matches!(decode_inbound(""), Err(TransportError::Decode(_)));
    }
}

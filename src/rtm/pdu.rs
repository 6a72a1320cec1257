//! PDU model and wire codec.
//!
//! Every message on the socket is one PDU shaped `{action, body, id?}`. The
//! semantic model is identical in both framings; only the byte encoding
//! differs: UTF-8 JSON text frames, or CBOR binary frames when the `cbor`
//! subprotocol was negotiated.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::SubscriptionOptions;
use crate::error::{Error, Result};

pub const ACTION_PUBLISH: &str = "rtm/publish";
pub const ACTION_SUBSCRIBE: &str = "rtm/subscribe";
pub const ACTION_UNSUBSCRIBE: &str = "rtm/unsubscribe";

pub const ACTION_SUBSCRIPTION_DATA: &str = "rtm/subscription/data";
pub const ACTION_SUBSCRIPTION_ERROR: &str = "rtm/subscription/error";
pub const ACTION_PUBLISH_OK: &str = "rtm/publish/ok";
pub const ACTION_PUBLISH_ERROR: &str = "rtm/publish/error";
pub const ACTION_SUBSCRIBE_OK: &str = "rtm/subscribe/ok";
pub const ACTION_SUBSCRIBE_ERROR: &str = "rtm/subscribe/error";
pub const ACTION_UNSUBSCRIBE_OK: &str = "rtm/unsubscribe/ok";
pub const ACTION_UNSUBSCRIBE_ERROR: &str = "rtm/unsubscribe/error";
pub const ACTION_GENERAL_ERROR: &str = "/error";

/// One protocol data unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdu {
    pub action: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Pdu {
    pub fn new(action: impl Into<String>, body: Value, id: Option<u64>) -> Self {
        Self {
            action: action.into(),
            body,
            id,
        }
    }
}

/// Encoded form of one PDU, matching the WebSocket frame type it travels in.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// PDU framing on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Cbor,
}

impl WireFormat {
    /// Subprotocol requested during the WebSocket upgrade.
    pub fn subprotocol(self) -> Option<&'static str> {
        match self {
            WireFormat::Json => None,
            WireFormat::Cbor => Some("cbor"),
        }
    }

    pub fn encode(self, pdu: &Pdu) -> Result<WireMessage> {
        match self {
            WireFormat::Json => {
                let text = serde_json::to_string(pdu)
                    .map_err(|e| Error::Codec(format!("json encode: {e}")))?;
                Ok(WireMessage::Text(text))
            }
            WireFormat::Cbor => {
                let mut buffer = Vec::new();
                ciborium::ser::into_writer(pdu, &mut buffer)
                    .map_err(|e| Error::Codec(format!("cbor encode: {e}")))?;
                Ok(WireMessage::Binary(buffer))
            }
        }
    }

    pub fn decode(self, payload: &[u8]) -> Result<Pdu> {
        match self {
            WireFormat::Json => serde_json::from_slice(payload)
                .map_err(|e| Error::Codec(format!("json decode: {e}"))),
            WireFormat::Cbor => ciborium::de::from_reader(payload)
                .map_err(|e| Error::Codec(format!("cbor decode: {e}"))),
        }
    }
}

/// Build a publish PDU.
pub fn publish_pdu(id: u64, channel: &str, message: Value) -> Pdu {
    Pdu::new(
        ACTION_PUBLISH,
        json!({ "channel": channel, "message": message }),
        Some(id),
    )
}

/// Build a subscribe PDU. The subscription id on the wire equals the
/// channel name; history fields are emitted only when requested.
pub fn subscribe_pdu(id: u64, channel: &str, options: &SubscriptionOptions) -> Pdu {
    let mut body = json!({ "channel": channel, "subscription_id": channel });

    if options.history.age.is_some() || options.history.count.is_some() {
        let mut history = serde_json::Map::new();
        if let Some(age) = options.history.age {
            history.insert("age".into(), age.into());
        }
        if let Some(count) = options.history.count {
            history.insert("count".into(), count.into());
        }
        body["history"] = Value::Object(history);
    }

    Pdu::new(ACTION_SUBSCRIBE, body, Some(id))
}

/// Build an unsubscribe PDU.
pub fn unsubscribe_pdu(id: u64, channel: &str) -> Pdu {
    Pdu::new(
        ACTION_UNSUBSCRIBE,
        json!({ "subscription_id": channel }),
        Some(id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtm::History;

    #[test]
    fn test_publish_pdu_shape() {
        let pdu = publish_pdu(7, "lobby", json!({"x": 1}));

        assert_eq!(
            serde_json::to_value(&pdu).unwrap(),
            json!({
                "action": "rtm/publish",
                "body": { "channel": "lobby", "message": {"x": 1} },
                "id": 7
            })
        );
    }

    #[test]
    fn test_subscribe_pdu_without_history() {
        let pdu = subscribe_pdu(2, "lobby", &SubscriptionOptions::default());

        assert_eq!(
            serde_json::to_value(&pdu).unwrap(),
            json!({
                "action": "rtm/subscribe",
                "body": { "channel": "lobby", "subscription_id": "lobby" },
                "id": 2
            })
        );
    }

    #[test]
    fn test_subscribe_pdu_with_history() {
        let options = SubscriptionOptions {
            history: History {
                age: Some(30),
                count: Some(1),
            },
        };
        let pdu = subscribe_pdu(3, "meta", &options);

        assert_eq!(
            pdu.body["history"],
            json!({ "age": 30, "count": 1 })
        );
    }

    #[test]
    fn test_unsubscribe_pdu_shape() {
        let pdu = unsubscribe_pdu(4, "lobby");

        assert_eq!(
            serde_json::to_value(&pdu).unwrap(),
            json!({
                "action": "rtm/unsubscribe",
                "body": { "subscription_id": "lobby" },
                "id": 4
            })
        );
    }

    #[test]
    fn test_json_round_trip_identity() {
        let pdu = publish_pdu(42, "c", json!({"nested": {"k": [1, 2, 3]}, "s": "text"}));

        let encoded = WireFormat::Json.encode(&pdu).unwrap();
        let WireMessage::Text(text) = &encoded else {
            panic!("json framing must use text frames");
        };
        let decoded = WireFormat::Json.decode(text.as_bytes()).unwrap();

        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_cbor_round_trip_identity() {
        let pdu = subscribe_pdu(9, "frames", &SubscriptionOptions::with_history_count(1));

        let encoded = WireFormat::Cbor.encode(&pdu).unwrap();
        let WireMessage::Binary(bytes) = &encoded else {
            panic!("cbor framing must use binary frames");
        };
        let decoded = WireFormat::Cbor.decode(bytes).unwrap();

        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_decode_without_id_or_body() {
        let pdu = WireFormat::Json
            .decode(br#"{"action":"rtm/publish/ok","id":12}"#)
            .unwrap();
        assert_eq!(pdu.action, ACTION_PUBLISH_OK);
        assert_eq!(pdu.id, Some(12));
        assert!(pdu.body.is_null());

        let pdu = WireFormat::Json.decode(br#"{"action":"/error"}"#).unwrap();
        assert_eq!(pdu.id, None);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(WireFormat::Json.decode(b"{nope").is_err());
        assert!(WireFormat::Cbor.decode(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn test_subprotocol_selection() {
        assert_eq!(WireFormat::Cbor.subprotocol(), Some("cbor"));
        assert_eq!(WireFormat::Json.subprotocol(), None);
    }
}

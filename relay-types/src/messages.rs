//! JSON frames exchanged between the relay and its clients.
//!
//! Client frames are wrapped in a [`TypedMessage`] envelope. The relay never
//! trusts the envelope's `Type` for dispatch: [`InboundMessage::decode`] tries
//! each known shape of `Data` in a fixed order instead.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::borrow::Cow;

use crate::TypesError;

/// The `{"Type": ..., "Data": ...}` envelope around client frames.
#[derive(Debug, Serialize, Deserialize)]
pub struct TypedMessage {
    /// Informational message type name
    #[serde(rename = "Type", alias = "type", default)]
    pub message_type: String,
    /// The wrapped message, still undecoded
    #[serde(rename = "Data", alias = "data")]
    pub data: Box<RawValue>,
}

impl TypedMessage {
    /// Wrap a message in an envelope.
    pub fn wrap<T: Serialize>(message_type: &str, message: &T) -> Result<Self, TypesError> {
        let raw = serde_json::to_string(message)?;
        Ok(Self {
            message_type: message_type.to_string(),
            data: RawValue::from_string(raw)?,
        })
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> Result<String, TypesError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Extract the message JSON from a client frame.
///
/// Enveloped frames yield their `Data`; a bare JSON object is accepted as its
/// own payload. Anything else is a malformed frame.
pub fn envelope_data(text: &str) -> Result<Cow<'_, str>, TypesError> {
    split_envelope(text).map(|(_, data)| data)
}

/// Like [`envelope_data`], also returning the envelope's `Type` when present.
pub fn split_envelope(text: &str) -> Result<(Option<String>, Cow<'_, str>), TypesError> {
    if let Ok(envelope) = serde_json::from_str::<TypedMessage>(text) {
        let data = Cow::Owned(envelope.data.get().to_string());
        return Ok((Some(envelope.message_type), data));
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(_)) => Ok((None, Cow::Borrowed(text))),
        Ok(_) => Err(TypesError::MalformedFrame("expected a JSON object".to_string())),
        Err(e) => Err(TypesError::MalformedFrame(e.to_string())),
    }
}

/// Decode a message from the JSON produced by [`envelope_data`].
pub fn decode_data<T: DeserializeOwned>(data: &str) -> Result<T, TypesError> {
    Ok(serde_json::from_str(data)?)
}

/// First frame of the subscription-key flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Reader identity used for read tracking
    #[serde(rename = "userID", default)]
    pub user_id: String,
    /// Canonical subscription key, validated by the relay
    #[serde(rename = "subscriptionKey", default)]
    pub subscription_key: String,
}

/// A relayed message.
///
/// Sent by the relay for replayed and live messages (no recipient), and by
/// clients to hand a message to the network for `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Content address of the payload
    #[serde(default)]
    pub id: String,
    /// Base64-encoded opaque payload
    #[serde(rename = "encryptedMessage")]
    pub message: String,
    /// Destination peer for client-originated messages
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipient: String,
}

/// Acknowledgement that the client has read a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Id of the message being acknowledged
    #[serde(rename = "messageID")]
    pub message_id: String,
}

/// Frames a serving connection accepts from its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Outbound relay request
    Encrypted(EncryptedMessage),
    /// Read acknowledgement
    Ack(AckMessage),
}

impl InboundMessage {
    /// Decode the `Data` of a client frame.
    ///
    /// Tries [`EncryptedMessage`] first, then [`AckMessage`]; the first shape
    /// that decodes wins. An object carrying both `encryptedMessage` and
    /// `messageID` is therefore an `Encrypted` message.
    pub fn decode(data: &str) -> Result<Self, TypesError> {
        if let Ok(message) = serde_json::from_str::<EncryptedMessage>(data) {
            return Ok(Self::Encrypted(message));
        }
        if let Ok(ack) = serde_json::from_str::<AckMessage>(data) {
            return Ok(Self::Ack(ack));
        }
        Err(TypesError::UnknownMessage)
    }

    /// The envelope `Type` name conventionally used for this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Encrypted(_) => "EncryptedMessage",
            Self::Ack(_) => "AckMessage",
        }
    }
}

/// First frame of the identity-proof flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAuthRequest {
    /// Claimed peer identity
    #[serde(rename = "peerID")]
    pub peer_id: String,
    /// Hex-encoded Ed25519 public key
    pub pubkey: String,
}

/// Client answer to an identity-proof challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Hex-encoded decrypted challenge nonce
    pub nonce: String,
}

/// Every frame the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Replayed or live message
    Message(EncryptedMessage),
    /// Authentication result
    Auth {
        /// Whether authentication succeeded
        auth: bool,
    },
    /// Identity-proof challenge
    Challenge {
        /// Hex-encoded challenge ciphertext
        challenge: String,
    },
    /// Error reported before the relay closes the connection
    Error {
        /// Human-readable reason
        error: String,
    },
}

impl ServerFrame {
    /// An `{"error": ...}` frame.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, TypesError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame written by the relay.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_data_unwraps_typed_message() {
        let text = json!({
            "Type": "SubscribeMessage",
            "Data": {"userID": "alice", "subscriptionKey": "Qm"}
        })
        .to_string();

        let data = envelope_data(&text).unwrap();
        let req: SubscribeRequest = decode_data(&data).unwrap();
        assert_eq!(req.user_id, "alice");
        assert_eq!(req.subscription_key, "Qm");
    }

    #[test]
    fn envelope_data_accepts_bare_object() {
        let text = r#"{"peerID": "abc", "pubkey": "00"}"#;
        let data = envelope_data(text).unwrap();
        let req: IdentityAuthRequest = decode_data(&data).unwrap();
        assert_eq!(req.peer_id, "abc");
    }

    #[test]
    fn split_envelope_reports_type() {
        let text = r#"{"Type": "AckMessage", "Data": {"messageID": "m1"}}"#;
        let (message_type, data) = split_envelope(text).unwrap();
        assert_eq!(message_type.as_deref(), Some("AckMessage"));
        let ack: AckMessage = decode_data(&data).unwrap();
        assert_eq!(ack.message_id, "m1");

        let (message_type, _) = split_envelope(r#"{"messageID": "m1"}"#).unwrap();
        assert!(message_type.is_none());
    }

    #[test]
    fn envelope_data_rejects_non_objects() {
        assert!(envelope_data("not json").is_err());
        assert!(envelope_data("[1, 2]").is_err());
        assert!(envelope_data("\"str\"").is_err());
    }

    #[test]
    fn inbound_decode_prefers_encrypted_message() {
        let data = r#"{"encryptedMessage": "aGk=", "recipient": "peer", "messageID": "x"}"#;
        match InboundMessage::decode(data).unwrap() {
            InboundMessage::Encrypted(m) => {
                assert_eq!(m.message, "aGk=");
                assert_eq!(m.recipient, "peer");
            }
            other => panic!("expected Encrypted, got {:?}", other),
        }
    }

    #[test]
    fn inbound_decode_falls_back_to_ack() {
        let data = r#"{"messageID": "abc"}"#;
        assert_eq!(
            InboundMessage::decode(data).unwrap(),
            InboundMessage::Ack(AckMessage {
                message_id: "abc".to_string()
            })
        );
    }

    #[test]
    fn inbound_decode_unknown_shape() {
        assert!(matches!(
            InboundMessage::decode(r#"{"hello": 1}"#),
            Err(TypesError::UnknownMessage)
        ));
    }

    #[test]
    fn server_frames_match_wire_shapes() {
        assert_eq!(
            ServerFrame::Auth { auth: true }.to_json().unwrap(),
            r#"{"auth":true}"#
        );
        assert_eq!(
            ServerFrame::error("userID required").to_json().unwrap(),
            r#"{"error":"userID required"}"#
        );
        assert_eq!(
            ServerFrame::Challenge {
                challenge: "ff".to_string()
            }
            .to_json()
            .unwrap(),
            r#"{"challenge":"ff"}"#
        );

        let live = ServerFrame::Message(EncryptedMessage {
            id: "abc".to_string(),
            message: "aGk=".to_string(),
            recipient: String::new(),
        });
        assert_eq!(
            live.to_json().unwrap(),
            r#"{"id":"abc","encryptedMessage":"aGk="}"#
        );
    }

    #[test]
    fn server_frame_parses_back() {
        let frame = ServerFrame::from_json(r#"{"id":"abc","encryptedMessage":"aGk="}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Message(_)));

        let frame = ServerFrame::from_json(r#"{"auth":false}"#).unwrap();
        assert_eq!(frame, ServerFrame::Auth { auth: false });
    }

    #[test]
    fn typed_message_wrap() {
        let ack = AckMessage {
            message_id: "abc".to_string(),
        };
        let json = TypedMessage::wrap("AckMessage", &ack).unwrap().to_json().unwrap();
        assert_eq!(json, r#"{"Type":"AckMessage","Data":{"messageID":"abc"}}"#);
    }
}

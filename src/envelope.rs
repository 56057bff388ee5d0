//! Envelope codec.
//!
//! The outer message shape carrying metadata, addressing, and a tagged
//! payload. Implemented as a `serde` internally-tagged enum.

use crate::error::EnvelopeError;
use serde::{Deserialize, Serialize};

/// One side of an envelope's addressing: the account and the signing key
/// acting on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Account identifier, or the case-insensitive literal `"node"`.
    pub account: String,
    /// The signer address.
    pub signer: String,
}

/// The polymorphic payload carried by an envelope.
///
/// Tag comparison on the wire is exact and case-sensitive (`Offer`,
/// `Answer`, `Rejection`, `Candidate`, `Broadcast`, `Relay`); unknown tags
/// are rejected at the codec boundary rather than silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A local SDP offer.
    Offer {
        /// SDP offer text.
        sdp: String,
    },
    /// A local SDP answer.
    Answer {
        /// SDP answer text.
        sdp: String,
    },
    /// A symmetrical rejection of an offer.
    Rejection {},
    /// An ICE candidate.
    Candidate {
        /// Candidate line (`candidate:...`).
        candidate: String,
        #[serde(rename = "sdpMid")]
        /// Media stream identification tag; `"0"` on the wire means "null"
        /// locally, per the interop normalization rule.
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        /// Media line index, when present.
        sdp_m_line_index: Option<u16>,
    },
    /// A broadcast payload routed to every other account channel.
    Broadcast {
        /// Broadcast text.
        text: String,
    },
    /// A payload relayed to a named receiver.
    Relay {
        /// Receiver address.
        receiver: String,
        /// Relayed text.
        text: String,
    },
}

/// The outer envelope shape, per §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix timestamp (seconds) the envelope was created.
    pub timestamp: i64,
    /// Maximum age in seconds before the envelope is considered expired.
    #[serde(rename = "maxAge")]
    pub max_age: i32,
    /// Delivery priority (opaque to the channel subsystem).
    pub priority: i32,
    /// Monotonic sequence number assigned by the sender.
    pub sequence: i64,
    /// Sender addressing.
    pub sender: Party,
    /// Receiver addressing.
    pub receiver: Party,
    /// The tagged payload.
    pub payload: Message,
    /// Signature over the envelope, base64 or hex encoded (opaque here).
    pub signature: String,
}

impl Envelope {
    /// `now - timestamp > maxAge` per §3's expiry rule.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.timestamp > i64::from(self.max_age)
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    /// Returns an error only on a `serde_json` internal failure; envelope
    /// shapes produced by this crate always serialize successfully.
    pub fn serialize(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::BadFormat(e.to_string()))
    }

    /// `true` if `text` looks like an envelope: valid JSON carrying a
    /// `payload.type` field, without fully decoding the payload.
    #[must_use]
    pub fn is_envelope(text: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };
        value
            .get("payload")
            .and_then(|p| p.get("type"))
            .and_then(serde_json::Value::as_str)
            .is_some()
    }

    /// Decode `text` into an envelope, validating the payload tag.
    ///
    /// # Errors
    /// - [`EnvelopeError::BadFormat`] if `text` is not valid JSON or is
    ///   missing required outer fields.
    /// - [`EnvelopeError::MissingPayload`] if `text` is well-formed JSON but
    ///   has no `payload.type` field.
    /// - [`EnvelopeError::UnknownKind`] if `payload.type` does not match any
    ///   [`Message`] variant.
    pub fn deserialize(text: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::BadFormat(e.to_string()))?;

        let kind = value
            .get("payload")
            .and_then(|p| p.get("type"))
            .and_then(serde_json::Value::as_str);

        let Some(kind) = kind else {
            return Err(EnvelopeError::MissingPayload);
        };

        const KNOWN: &[&str] = &["Offer", "Answer", "Rejection", "Candidate", "Broadcast", "Relay"];
        if !KNOWN.contains(&kind) {
            return Err(EnvelopeError::UnknownKind(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| EnvelopeError::BadFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Message) -> Envelope {
        Envelope {
            timestamp: 1_000,
            max_age: 60,
            priority: 0,
            sequence: 1,
            sender: Party { account: "node".to_string(), signer: "a".repeat(40) },
            receiver: Party { account: "node".to_string(), signer: "b".repeat(40) },
            payload,
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let variants = vec![
            Message::Offer { sdp: "v=0".to_string() },
            Message::Answer { sdp: "v=0".to_string() },
            Message::Rejection {},
            Message::Candidate {
                candidate: "candidate:1 1 UDP 1 1.2.3.4 5 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
            Message::Broadcast { text: "hi".to_string() },
            Message::Relay { receiver: "c".repeat(40), text: "hi".to_string() },
        ];

        for payload in variants {
            let envelope = sample(payload);
            let text = envelope.serialize().unwrap();
            let decoded = Envelope::deserialize(&text).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let text = r#"{"payload":{"type":"Rejection"},"timestamp":1,"maxAge":60,"priority":0,"sequence":1,"sender":{"account":"node","signer":"a"},"receiver":{"account":"node","signer":"b"},"signature":"s"}"#;
        assert!(Envelope::deserialize(text).is_ok());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let text = r#"{"payload":{"type":"Mystery"},"timestamp":1,"maxAge":60,"priority":0,"sequence":1,"sender":{"account":"node","signer":"a"},"receiver":{"account":"node","signer":"b"},"signature":"s"}"#;
        assert!(matches!(Envelope::deserialize(text), Err(EnvelopeError::UnknownKind(_))));
    }

    #[test]
    fn test_missing_payload_type_is_not_an_envelope() {
        let text = r#"{"payload":{},"timestamp":1}"#;
        assert!(!Envelope::is_envelope(text));
        assert!(matches!(Envelope::deserialize(text), Err(EnvelopeError::MissingPayload)));
    }

    #[test]
    fn test_non_json_is_bad_format() {
        assert!(!Envelope::is_envelope("not json"));
        assert!(matches!(Envelope::deserialize("not json"), Err(EnvelopeError::BadFormat(_))));
    }

    #[test]
    fn test_expiry() {
        let envelope = sample(Message::Rejection {});
        assert!(!envelope.is_expired(1_030));
        assert!(envelope.is_expired(1_061));
    }
}

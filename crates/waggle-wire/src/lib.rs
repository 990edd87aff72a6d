// Wire schema for messages carried on the log transport.
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

/// Request half of an RPC exchange.
///
/// The correlation id ties every response back to this request; it must be
/// globally unique per call. `single_reply` tells the responder whether the
/// caller expects exactly one reply or an open-ended stream ended by a
/// terminal reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub correlation_id: String,
    pub single_reply: bool,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(correlation_id: impl Into<String>, single_reply: bool, body: Vec<u8>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            single_reply,
            body,
        }
    }
}

/// Response half of an RPC exchange.
///
/// ```
/// use waggle_wire::Response;
///
/// let response = Response::success("corr-1", b"pong".to_vec(), true);
/// assert!(response.last);
/// assert!(!response.failed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: String,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub last: bool,
    pub failed: bool,
}

impl Response {
    pub fn success(correlation_id: impl Into<String>, body: Vec<u8>, last: bool) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body,
            last,
            failed: false,
        }
    }

    // A failure is always terminal; the body carries the error description.
    pub fn failure(correlation_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: description.into().into_bytes(),
            last: true,
            failed: true,
        }
    }
}

/// Messages encoded onto the log transport.
///
/// ```
/// use waggle_wire::{Message, Request};
///
/// let message = Message::Request(Request::new("corr-1", true, b"ping".to_vec()));
/// let encoded = message.encode().expect("encode");
/// let decoded = Message::decode(&encoded).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
    // Change-feed event: something changed for `subject` on the named feed.
    Change { feed: String, subject: String },
}

impl Message {
    pub fn encode(&self) -> Result<Bytes> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Ok(Bytes::from(payload))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Vec<u8> as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Vec<u8>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let message = Message::Request(Request::new("corr-1", true, b"ping".to_vec()));
        let encoded = message.encode().expect("encode");
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn response_round_trip() {
        let message = Message::Response(Response::success("corr-2", b"pong".to_vec(), true));
        let encoded = message.encode().expect("encode");
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn change_round_trip() {
        let message = Message::Change {
            feed: "notification".to_string(),
            subject: "2b6f8f3a-0000-4000-8000-000000000001".to_string(),
        };
        let encoded = message.encode().expect("encode");
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = Message::decode(b"{not json").expect_err("malformed");
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn decode_rejects_bad_base64_body() {
        let err = Message::decode(
            br#"{"type":"request","correlation_id":"c","single_reply":true,"body":"!!"}"#,
        )
        .expect_err("bad body");
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn failure_is_terminal_and_flagged() {
        let response = Response::failure("corr-3", "handler error: boom");
        assert!(response.last);
        assert!(response.failed);
        assert_eq!(response.body, b"handler error: boom");
    }
}

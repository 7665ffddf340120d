//! Wire envelopes for call/respond correlation
//!
//! Every call/respond message body is compact UTF-8 JSON. Requests carry a
//! caller-chosen correlation token next to the request payload; answers echo
//! the token back verbatim so the caller can reattach context. The bridge
//! never interprets tokens.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An opaque correlation token.
///
/// Modeled as a closed union over the JSON value kinds callers actually use
/// (integer, string, mapping) instead of an open `Value`, so tokens stay
/// strongly typed while remaining opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    Int(i64),
    Str(String),
    Map(BTreeMap<String, Token>),
}

impl Token {
    /// Builds a single-entry map token, the common "which user" shape
    pub fn keyed(key: &str, value: impl Into<Token>) -> Token {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value.into());
        Token::Map(map)
    }
}

impl From<i64> for Token {
    fn from(value: i64) -> Self {
        Token::Int(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token::Str(value.to_string())
    }
}

/// A tagged request as it travels on a request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub token: Token,
    pub request: Value,
}

/// A tagged answer as it travels on an answer queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub token: Token,
    pub answer: Value,
}

/// Encodes a message body as compact JSON bytes
pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// Decodes a message body from JSON bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let original = CallRequest {
            token: Token::keyed("uid", 42),
            request: json!({"url": "http://cian.ru/cat.php?x=1"}),
        };
        let bytes = encode(&original).unwrap();
        let decoded: CallRequest = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_answer_round_trip() {
        let original = CallAnswer {
            token: Token::Int(7),
            answer: json!([101, 102, 103]),
        };
        let bytes = encode(&original).unwrap();
        let decoded: CallAnswer = decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_string_token_round_trip() {
        let original = CallAnswer {
            token: Token::from("job-7"),
            answer: json!(true),
        };
        let decoded: CallAnswer = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_map_token_serializes_as_plain_json() {
        let token = Token::keyed("uid", 42);
        let bytes = encode(&CallRequest {
            token,
            request: json!({}),
        })
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"token":{"uid":42},"request":{}}"#);
    }

    #[test]
    fn test_encoding_is_compact() {
        let bytes = encode(&json!({"a": 1, "b": [1, 2]})).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let result: serde_json::Result<CallRequest> = decode(b"not json");
        assert!(result.is_err());
    }
}

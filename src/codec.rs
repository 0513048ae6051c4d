//! Payload encodings.
//!
//! Two encodings are supported side by side: JSON for human-readable
//! payloads and bincode for compact binary ones. Every published message is
//! tagged with its codec's content type so consumers can select the decoder
//! per delivery.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{PubSubError, Result};

/// Content type of JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of bincode payloads.
pub const CONTENT_TYPE_BINCODE: &str = "application/x-bincode";

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Structured text (`application/json`).
    Json,

    /// Compact binary (`application/x-bincode`).
    Bincode,
}

impl Codec {
    /// Content-type tag carried on messages produced by this codec.
    pub fn content_type(self) -> &'static str {
        match self {
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::Bincode => CONTENT_TYPE_BINCODE,
        }
    }

    /// Look up the codec for a content-type tag.
    ///
    /// Parameters after `;` (e.g. `; charset=utf-8`) are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Codec> {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        if mime.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            Some(Codec::Json)
        } else if mime.eq_ignore_ascii_case(CONTENT_TYPE_BINCODE) {
            Some(Codec::Bincode)
        } else {
            None
        }
    }

    /// Serialize a value.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        // ---
        let bytes = match self {
            Codec::Json => serde_json::to_vec(value)
                .map_err(|e| PubSubError::Encode(format!("json: {e}")))?,
            Codec::Bincode => bincode::serialize(value)
                .map_err(|e| PubSubError::Encode(format!("bincode: {e}")))?,
        };
        Ok(Bytes::from(bytes))
    }

    /// Deserialize a value.
    ///
    /// Fails with [`PubSubError::Decode`] when the bytes do not have the
    /// shape of `T`. Bincode payloads with trailing bytes are rejected.
    pub fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T> {
        // ---
        match self {
            Codec::Json => serde_json::from_slice(payload)
                .map_err(|e| PubSubError::Decode(format!("json: {e}"))),
            Codec::Bincode => {
                use bincode::Options;

                bincode::DefaultOptions::new()
                    .with_fixint_encoding()
                    .reject_trailing_bytes()
                    .deserialize(payload)
                    .map_err(|e| PubSubError::Decode(format!("bincode: {e}")))
            }
        }
    }
}

/// Decode a delivered payload for a subscription expecting `expected`.
///
/// The content-type tag on the delivery selects the decoder. A missing tag
/// falls back to `expected`; an unknown tag, or one naming a different
/// codec, is a decode error since a single stream never mixes encodings.
pub(crate) fn decode_delivery<T: DeserializeOwned>(
    content_type: Option<&str>,
    expected: Codec,
    payload: &[u8],
) -> Result<T> {
    // ---
    let codec = match content_type {
        None => expected,
        Some(tag) => match Codec::from_content_type(tag) {
            Some(codec) if codec == expected => codec,
            Some(codec) => {
                return Err(PubSubError::Decode(format!(
                    "content type {tag} ({codec:?}) does not match subscription codec {expected:?}"
                )))
            }
            None => {
                return Err(PubSubError::Decode(format!(
                    "unsupported content type: {tag}"
                )))
            }
        },
    };

    codec.decode(payload)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        count: u32,
        tags: Vec<String>,
    }

    fn probe() -> Probe {
        Probe {
            name: "asia".into(),
            count: 3,
            tags: vec!["infantry".into(), "cavalry".into()],
        }
    }

    #[test]
    fn test_round_trip_both_codecs() {
        // ---
        for codec in [Codec::Json, Codec::Bincode] {
            let bytes = codec.encode(&probe()).unwrap();
            let back: Probe = codec.decode(&bytes).unwrap();
            assert_eq!(back, probe(), "{codec:?}");
        }
    }

    #[test]
    fn test_json_is_text() {
        // ---
        let bytes = Codec::Json.encode(&probe()).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"name\":\"asia\""));
    }

    #[test]
    fn test_malformed_json_rejected() {
        // ---
        let err = Codec::Json.decode::<Probe>(b"{\"name\": 42").unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));

        let err = Codec::Json.decode::<Probe>(b"{\"other\": true}").unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));
    }

    #[test]
    fn test_malformed_bincode_rejected() {
        // ---
        let err = Codec::Bincode.decode::<Probe>(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));

        let mut bytes = Codec::Bincode.encode(&probe()).unwrap().to_vec();
        bytes.push(0xff);
        let err = Codec::Bincode.decode::<Probe>(&bytes).unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        // ---
        assert!(Codec::Json.decode::<Probe>(b"").is_err());
        assert!(Codec::Bincode.decode::<Probe>(b"").is_err());
    }

    #[test]
    fn test_content_type_lookup() {
        // ---
        assert_eq!(
            Codec::from_content_type("application/json"),
            Some(Codec::Json)
        );
        assert_eq!(
            Codec::from_content_type("application/json; charset=utf-8"),
            Some(Codec::Json)
        );
        assert_eq!(
            Codec::from_content_type("application/x-bincode"),
            Some(Codec::Bincode)
        );
        assert_eq!(Codec::from_content_type("text/plain"), None);
    }

    #[test]
    fn test_decode_delivery_selects_by_tag() {
        // ---
        let bytes = Codec::Bincode.encode(&probe()).unwrap();
        let back: Probe =
            decode_delivery(Some(CONTENT_TYPE_BINCODE), Codec::Bincode, &bytes).unwrap();
        assert_eq!(back, probe());

        let untagged: Probe = decode_delivery(None, Codec::Bincode, &bytes).unwrap();
        assert_eq!(untagged, probe());
    }

    #[test]
    fn test_decode_delivery_rejects_foreign_tags() {
        // ---
        let bytes = Codec::Json.encode(&probe()).unwrap();

        let err = decode_delivery::<Probe>(Some(CONTENT_TYPE_JSON), Codec::Bincode, &bytes)
            .unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));

        let err = decode_delivery::<Probe>(Some("application/gob"), Codec::Json, &bytes)
            .unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));
    }
}

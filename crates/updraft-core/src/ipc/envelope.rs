//! Schema-tagged serialization for opaque archived objects.
//!
//! Installation input, appcast items, and installation info cross the wire
//! as JSON wrapped in a one-level envelope: `{"tag": <schema name>, "body":
//! <object>}`. Decoding refuses any envelope whose top-level tag is not the
//! expected one, and the body types all carry `deny_unknown_fields`, so a
//! peer cannot smuggle an object of one schema into a slot expecting
//! another.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from tagged envelope encoding and decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The payload is not a syntactically valid envelope.
    #[error("invalid envelope: {0}")]
    Invalid(#[source] serde_json::Error),

    /// The envelope carries a different schema than the decoder expects.
    #[error("unexpected tag {actual:?}, expected {expected:?}")]
    UnexpectedTag {
        /// Tag found on the wire.
        actual: String,
        /// Tag the caller required.
        expected: &'static str,
    },

    /// The body does not conform to the expected schema.
    #[error("invalid body for tag {tag:?}: {source}")]
    InvalidBody {
        /// Tag of the envelope whose body failed to decode.
        tag: &'static str,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    tag: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    tag: String,
    body: serde_json::Value,
}

/// Encode `body` under the given schema tag.
///
/// # Errors
///
/// Returns [`EnvelopeError::Invalid`] if the body fails to serialize.
pub fn encode_tagged<T: Serialize>(tag: &'static str, body: &T) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec(&EnvelopeRef { tag, body }).map_err(EnvelopeError::Invalid)
}

/// Decode an envelope, requiring its top-level tag to equal `expected`.
///
/// # Errors
///
/// Returns [`EnvelopeError::UnexpectedTag`] when the tag differs, and the
/// other variants on malformed input.
pub fn decode_tagged<T: DeserializeOwned>(
    expected: &'static str,
    bytes: &[u8],
) -> Result<T, EnvelopeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Invalid)?;
    if raw.tag != expected {
        return Err(EnvelopeError::UnexpectedTag {
            actual: raw.tag,
            expected,
        });
    }
    serde_json::from_value(raw.body).map_err(|source| EnvelopeError::InvalidBody {
        tag: expected,
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn roundtrip_under_matching_tag() {
        let sample = Sample {
            name: "alpha".into(),
            count: 3,
        };
        let bytes = encode_tagged("sample", &sample).unwrap();
        let decoded: Sample = decode_tagged("sample", &bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn refuses_wrong_tag() {
        let sample = Sample {
            name: "alpha".into(),
            count: 3,
        };
        let bytes = encode_tagged("sample", &sample).unwrap();
        let err = decode_tagged::<Sample>("other", &bytes).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnexpectedTag { .. }));
    }

    #[test]
    fn refuses_unknown_body_fields() {
        let bytes =
            br#"{"tag":"sample","body":{"name":"alpha","count":3,"extra":true}}"#.to_vec();
        let err = decode_tagged::<Sample>("sample", &bytes).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidBody { .. }));
    }

    #[test]
    fn refuses_garbage() {
        assert!(matches!(
            decode_tagged::<Sample>("sample", b"not json"),
            Err(EnvelopeError::Invalid(_))
        ));
    }
}

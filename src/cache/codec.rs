//! Value encodings.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// How values are turned into bytes for the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    Yaml,
}

impl Encoding {
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, CodecError> {
        let bytes = match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        };
        Ok(Bytes::from(bytes))
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::Yaml => serde_yaml::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_json_bytes_are_plain_json() {
        let value = BTreeMap::from([("n", "Yan")]);
        let bytes = Encoding::Json.encode(&value).unwrap();
        assert_eq!(&bytes[..], br#"{"n":"Yan"}"#);
    }

    #[test]
    fn test_decode_error_is_reported() {
        let err = Encoding::Json.decode::<u32>(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}

//! Payload encodings.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{DecodeError, EncodeError};

/// How envelopes, arguments and results are serialized on a connection.
///
/// Both peers must agree; nothing on the wire negotiates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// JSON text. Arguments and results travel as JSON strings inside the envelope.
    #[default]
    Json,
    /// postcard binary. Arguments and results travel as byte arrays.
    Postcard,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Postcard => "postcard",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, EncodeError> {
        let result = match self {
            Encoding::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Encoding::Postcard => postcard::to_stdvec(value).map_err(|e| e.to_string()),
        };
        result.map_err(|message| EncodeError {
            encoding: self.name(),
            message,
        })
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, DecodeError> {
        let result = match self {
            Encoding::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Encoding::Postcard => postcard::from_bytes(bytes).map_err(|e| e.to_string()),
        };
        result.map_err(|message| DecodeError {
            encoding: self.name(),
            message,
        })
    }

    /// Decode a result that the peer left absent.
    ///
    /// A missing `Data` field means "void success"; this succeeds for `()`
    /// and `Option<T>`. With JSON, types that need a value fail to decode.
    pub fn decode_absent<T: DeserializeOwned>(self) -> Result<T, DecodeError> {
        match self {
            Encoding::Json => self.decode(b"null"),
            Encoding::Postcard => self.decode(&[0u8]),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "postcard" => Ok(Encoding::Postcard),
            other => Err(format!("unknown encoding {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_result_is_void() {
        for encoding in [Encoding::Json, Encoding::Postcard] {
            let () = encoding.decode_absent::<()>().unwrap();
            assert_eq!(encoding.decode_absent::<Option<i32>>().unwrap(), None);
        }
        assert!(Encoding::Json.decode_absent::<String>().is_err());
    }

    #[test]
    fn json_arguments_are_plain_json_text() {
        assert_eq!(Encoding::Json.encode(&1).unwrap(), b"1");
        assert_eq!(Encoding::Json.decode::<i32>(b"3").unwrap(), 3);
    }

    #[test]
    fn parses_names() {
        assert_eq!("JSON".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("postcard".parse::<Encoding>().unwrap(), Encoding::Postcard);
        assert!("xml".parse::<Encoding>().is_err());
    }
}

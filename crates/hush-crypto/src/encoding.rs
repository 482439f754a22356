//! Serde helpers: binary fields travel as standard base64 strings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// `Vec<u8>` <-> base64 string.
pub(crate) mod b64 {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// `[u8; N]` <-> base64 string, rejecting any other decoded length.
pub(crate) mod b64_array {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| {
            serde::de::Error::custom(format!("invalid length: expected {N} bytes, got {len}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wire {
        #[serde(with = "super::b64_array")]
        fixed: [u8; 4],
        #[serde(with = "super::b64")]
        dynamic: Vec<u8>,
    }

    #[test]
    fn test_fields_are_base64_strings() {
        let wire = Wire {
            fixed: [1, 2, 3, 4],
            dynamic: b"hush".to_vec(),
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, r#"{"fixed":"AQIDBA==","dynamic":"aHVzaA=="}"#);
        assert_eq!(serde_json::from_str::<Wire>(&json).unwrap(), wire);
    }

    #[test]
    fn test_wrong_array_length_rejected() {
        let json = r#"{"fixed":"AQID","dynamic":""}"#;
        assert!(serde_json::from_str::<Wire>(json).is_err());
    }
}

//! Wire value model of the table store
//!
//! Values arrive as single-key tagged objects (`{"S": "text"}`, `{"N": "1.5"}`,
//! `{"M": {...}}`). Binary members are base64 text on the wire so that a scan
//! cursor containing binary keys can be stored in the state document as-is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One item (row) as returned by a scan or carried by a stream record
pub type Item = HashMap<String, AttributeValue>;

/// Tagged attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// String
    #[serde(rename = "S")]
    S(String),
    /// Number, carried as decimal text
    #[serde(rename = "N")]
    N(String),
    /// Binary
    #[serde(rename = "B", with = "base64_bytes")]
    B(Vec<u8>),
    /// Boolean
    #[serde(rename = "BOOL")]
    Bool(bool),
    /// Null
    #[serde(rename = "NULL")]
    Null(bool),
    /// List of values
    #[serde(rename = "L")]
    L(Vec<AttributeValue>),
    /// Map of values
    #[serde(rename = "M")]
    M(HashMap<String, AttributeValue>),
    /// String set
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    /// Number set
    #[serde(rename = "NS")]
    Ns(Vec<String>),
    /// Binary set
    #[serde(rename = "BS", with = "base64_byte_sets")]
    Bs(Vec<Vec<u8>>),
}

impl AttributeValue {
    /// Wire tag of this value
    pub fn tag(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null(_) => "NULL",
            Self::L(_) => "L",
            Self::M(_) => "M",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
            Self::Bs(_) => "BS",
        }
    }

    /// Shortcut for a string value
    pub fn s(value: impl Into<String>) -> Self {
        Self::S(value.into())
    }

    /// Shortcut for a number value
    pub fn n(value: impl ToString) -> Self {
        Self::N(value.to_string())
    }

    /// String content, if this is an `S`
    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    /// Number text, if this is an `N`
    pub fn as_n(&self) -> Option<&str> {
        match self {
            Self::N(n) => Some(n),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod base64_byte_sets {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sets: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(sets.len()))?;
        for bytes in sets {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_tags() {
        let value: AttributeValue = serde_json::from_value(json!({"S": "hello"})).unwrap();
        assert_eq!(value, AttributeValue::s("hello"));

        let value: AttributeValue = serde_json::from_value(json!({"BOOL": true})).unwrap();
        assert_eq!(value, AttributeValue::Bool(true));

        let value: AttributeValue =
            serde_json::from_value(json!({"L": [{"N": "1"}, {"NULL": true}]})).unwrap();
        assert_eq!(
            value,
            AttributeValue::L(vec![AttributeValue::n(1), AttributeValue::Null(true)])
        );
    }

    #[test]
    fn test_binary_is_base64_on_the_wire() {
        let value = AttributeValue::B(b"hello".to_vec());
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({"B": "aGVsbG8="}));

        let back: AttributeValue = serde_json::from_value(json!({"BS": ["aGk=", "eW8="]})).unwrap();
        assert_eq!(back, AttributeValue::Bs(vec![b"hi".to_vec(), b"yo".to_vec()]));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result: std::result::Result<AttributeValue, _> =
            serde_json::from_value(json!({"X": "what"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_cursor_item_roundtrip() {
        let mut key = Item::new();
        key.insert("id".to_string(), AttributeValue::n(1000));
        key.insert("blob".to_string(), AttributeValue::B(vec![0, 159, 146, 150]));

        let stored = serde_json::to_value(&key).unwrap();
        let restored: Item = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, key);
    }
}

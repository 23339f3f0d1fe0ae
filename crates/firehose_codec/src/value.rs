//! Dynamic DAG-CBOR value type.

use std::cmp::Ordering;

/// A dynamic DAG-CBOR value.
///
/// Covers the AT Protocol data model: floats are not representable and
/// the only tag is 42, surfaced as [`Value::Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `null`.
    Null,
    /// `true` or `false`.
    Bool(bool),
    /// Any integer that fits an `i64`; larger magnitudes are rejected on decode.
    Integer(i64),
    /// Raw bytes (major type 2).
    Bytes(Vec<u8>),
    /// UTF-8 text (major type 3).
    Text(String),
    /// Ordered items.
    Array(Vec<Value>),
    /// Entries as decoded or as built. The encoder sorts them by key.
    Map(Vec<(Value, Value)>),
    /// Content link (CBOR tag 42). Holds the raw tagged bytes, including
    /// the leading `0x00` multibase identity prefix.
    Link(Vec<u8>),
}

/// DAG-CBOR map key order: shorter keys first, equal lengths bytewise.
///
/// For text keys this is the order of their encoded forms.
pub fn key_order(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl Value {
    /// A map with its entries put in key order.
    ///
    /// Text keys sort by [`key_order`]; any other key sorts last and will be
    /// rejected by the encoder.
    pub fn map(mut entries: Vec<(Value, Value)>) -> Self {
        entries.sort_by(|(a, _), (b, _)| match (a.as_text(), b.as_text()) {
            (Some(a), Some(b)) => key_order(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Value::Map(entries)
    }

    /// A map from `(&str, Value)` entries, in key order.
    pub fn text_map<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self::map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::Text(key.to_owned()), value))
                .collect(),
        )
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Link(_) => "link",
        }
    }

    /// True for `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(flag) = self {
            Some(*flag)
        } else {
            None
        }
    }

    /// The integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        if let Value::Integer(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    /// The byte string, if this is one. Links are not byte strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if let Value::Bytes(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// The tagged bytes of a link.
    pub fn as_link(&self) -> Option<&[u8]> {
        if let Value::Link(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// The text, if this is a text string.
    pub fn as_text(&self) -> Option<&str> {
        if let Value::Text(text) = self {
            Some(text)
        } else {
            None
        }
    }

    /// The items, if this is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        if let Value::Array(items) = self {
            Some(items)
        } else {
            None
        }
    }

    /// The entries, if this is a map.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        if let Value::Map(entries) = self {
            Some(entries)
        } else {
            None
        }
    }

    /// Looks up a text key. `None` when absent or when this is not a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find_map(|(k, v)| (k.as_text() == Some(key)).then_some(v))
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        i64::from(n).into()
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        text.to_owned().into()
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &Value) -> Vec<&str> {
        map.as_map()
            .unwrap_or_default()
            .iter()
            .filter_map(|(key, _)| key.as_text())
            .collect()
    }

    #[test]
    fn frame_header_keys_in_key_order() {
        let header = Value::text_map([
            ("seq", Value::from(9)),
            ("op", Value::from(1)),
            ("t", Value::from("#commit")),
        ]);
        assert_eq!(keys(&header), ["t", "op", "seq"]);
    }

    #[test]
    fn key_order_is_length_then_bytes() {
        assert_eq!(key_order("zz", "aaa"), Ordering::Less);
        assert_eq!(key_order("ab", "aa"), Ordering::Greater);
        assert_eq!(key_order("cid", "cid"), Ordering::Equal);

        let mixed = Value::map(vec![
            (Value::from(7), Value::Null),
            (Value::from("did"), Value::Null),
            (Value::from("a"), Value::Null),
        ]);
        let kinds: Vec<_> = mixed.as_map().unwrap().iter().map(|(k, _)| k.kind()).collect();
        assert_eq!(kinds, ["text", "text", "integer"]);
    }

    #[test]
    fn accessors_only_match_their_variant() {
        let link = Value::Link(vec![0x00, 0x01]);
        assert_eq!(link.as_link(), Some(&[0x00, 0x01][..]));
        assert_eq!(link.as_bytes(), None);

        let flag = Value::from(true);
        assert_eq!(flag.as_bool(), Some(true));
        assert_eq!(flag.as_integer(), None);

        assert!(Value::from(()).is_null());
        assert_eq!(Value::from(&b"car"[..]).as_bytes(), Some(&b"car"[..]));
        assert_eq!(Value::from("did:plc:abc").as_text(), Some("did:plc:abc"));
        assert_eq!(Value::Array(vec![Value::Null]).as_array().map(<[_]>::len), Some(1));
    }

    #[test]
    fn get_looks_up_text_keys() {
        let commit = Value::text_map([
            ("repo", Value::from("did:plc:abc")),
            ("tooBig", Value::from(false)),
        ]);
        assert_eq!(commit.get("repo").and_then(Value::as_text), Some("did:plc:abc"));
        assert_eq!(commit.get("tooBig"), Some(&Value::Bool(false)));
        assert!(commit.get("rebase").is_none());
        assert!(Value::from("repo").get("repo").is_none());
    }
}

//! Rate limit keys.

use std::fmt;

/// A value identifying what a policy limits.
///
/// The set of variants is closed on purpose: key extractors can only return
/// these three shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Raw bytes, e.g. a packed network address
    Binary(Vec<u8>),
    /// Text, e.g. a probe target
    Text(String),
    /// Integer, e.g. a constant for global limits
    Integer(i64),
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Binary(bytes)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::Binary(bytes.to_vec())
    }
}

impl From<String> for Key {
    fn from(text: String) -> Self {
        Key::Text(text)
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Key::Text(text.to_string())
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Integer(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Binary(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Key::Text(text) => write!(f, "{:?}", text),
            Key::Integer(value) => write!(f, "{}", value),
        }
    }
}

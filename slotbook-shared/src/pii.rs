use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps a client contact (email, phone, handle) so it never shows up in
/// `Debug`/`Display` output, and therefore never in tracing fields.
///
/// Serialization writes the real value: API responses and persisted rows need it.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl From<String> for Masked<String> {
    fn from(value: String) -> Self {
        Masked(value)
    }
}

impl From<&str> for Masked<String> {
    fn from(value: &str) -> Self {
        Masked(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_value() {
        let contact = Masked::from("client@example.com");
        assert_eq!(format!("{:?}", contact), "********");
        assert_eq!(format!("{}", contact), "********");
    }

    #[test]
    fn test_serializes_real_value() {
        let contact = Masked::from("client@example.com");
        let json = serde_json::to_string(&contact).unwrap();
        assert_eq!(json, "\"client@example.com\"");

        let back: Masked<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expose(), "client@example.com");
    }
}

use std::fmt;
use uuid::Uuid;

/// Broker-side identifier of one consumer.
///
/// Tags are unique per channel; generated tags embed the connection id so a
/// consumer can be traced back to its process in the broker's management UI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Generate a new unique consumer tag for a connection.
    pub fn generate(connection_id: &str) -> Self {
        Self(format!("{connection_id}-{}", Uuid::new_v4()))
    }

    /// Borrow the consumer tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConsumerTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let tag1 = ConsumerTag::generate("client");
        let tag2 = ConsumerTag::generate("client");
        assert_ne!(tag1, tag2);
    }

    #[test]
    fn test_format() {
        // ---
        let tag = ConsumerTag::generate("client");
        let s = tag.to_string();
        assert!(s.starts_with("client-"));
        assert_eq!(s.len(), "client-".len() + 36); // Standard UUID format
    }
}

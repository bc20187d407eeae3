//! Request ID generation.
//!
//! Every routed request carries an identifier that shows up in logs and is
//! forwarded upstream as `x-request-id`.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Counter for short request IDs.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Request identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new UUID v4 based request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a process-local counter based request ID (`req-{hex}`).
    pub fn short() -> Self {
        let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("req-{:016x}", count))
    }

    /// Reuse an ID supplied by the client, falling back to a fresh one when
    /// the supplied value is empty.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self::short(),
        }
    }

    /// Get the request ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_request_id() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_short_request_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = RequestId::short();
            assert!(id.as_str().starts_with("req-"));
            assert!(ids.insert(id), "duplicate ID generated");
        }
    }

    #[test]
    fn test_from_header() {
        assert_eq!(RequestId::from_header(Some("abc-123")).as_str(), "abc-123");
        assert!(RequestId::from_header(Some("  ")).as_str().starts_with("req-"));
        assert!(RequestId::from_header(None).as_str().starts_with("req-"));
    }
}

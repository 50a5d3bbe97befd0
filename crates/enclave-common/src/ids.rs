//! Identifiers - Immutable value objects keyed into every enclave map
//!
//! Value Objects are:
//! - Immutable
//! - Comparable by value (not identity)
//! - Cheap to clone

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the partition every service lands in until a repartition says otherwise
pub const DEFAULT_PARTITION_ID: &str = "default";

/// Caller-chosen service identifier (Value Object)
///
/// Reusable over the lifetime of an enclave: once a service is removed its ID
/// may be registered again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create new service ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// True if the ID is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// True if the ID can name engine objects and directories
    ///
    /// Accepts `[A-Za-z0-9][A-Za-z0-9_.-]*`, the container name alphabet.
    pub fn is_valid_name(&self) -> bool {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {
                chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            }
            _ => false,
        }
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration-instance identifier (Value Object)
///
/// # Invariants
/// - Unique even when the same [`ServiceId`] is registered, removed and registered again
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceGuid(String);

impl ServiceGuid {
    /// Generate a fresh GUID for a registration of `service_id`
    pub fn generate(service_id: &ServiceId) -> Self {
        Self(format!("{}-{}", service_id, uuid::Uuid::new_v4().simple()))
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical partition identifier (Value Object)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Create new partition ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The partition that exists before any repartition
    pub fn default_partition() -> Self {
        Self(DEFAULT_PARTITION_ID.to_string())
    }

    /// True if no partition was named
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unordered pair of partitions (Value Object)
///
/// # Invariants
/// - `first <= second` lexicographically, so `(A, B)` and `(B, A)` hash identically
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    first: PartitionId,
    second: PartitionId,
}

impl PartitionConnectionId {
    /// Create a normalized connection ID from two partitions in any order
    pub fn new(a: impl Into<PartitionId>, b: impl Into<PartitionId>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// Lexicographically smaller partition
    pub fn first(&self) -> &PartitionId {
        &self.first
    }

    /// Lexicographically larger partition
    pub fn second(&self) -> &PartitionId {
        &self.second
    }
}

impl fmt::Display for PartitionConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_connection_id_is_unordered() {
        let ab = PartitionConnectionId::new("alpha", "beta");
        let ba = PartitionConnectionId::new("beta", "alpha");
        assert_eq!(ab, ba);
        assert_eq!(ab.first().as_str(), "alpha");
        assert_eq!(ab.second().as_str(), "beta");

        let mut overrides = HashMap::new();
        overrides.insert(ab, true);
        assert_eq!(overrides.get(&ba), Some(&true));
    }

    #[test]
    fn test_blank_service_id() {
        assert!(ServiceId::new("").is_blank());
        assert!(ServiceId::new("  \t").is_blank());
        assert!(!ServiceId::new("db").is_blank());
    }

    #[test]
    fn test_service_id_name_alphabet() {
        for ok in ["db", "api-1", "web_2.internal", "9lives"] {
            assert!(ServiceId::new(ok).is_valid_name(), "{}", ok);
        }
        for bad in ["", "../../x", "a/b", "has space", "-lead", ".hidden", "ümlaut"] {
            assert!(!ServiceId::new(bad).is_valid_name(), "{}", bad);
        }
    }

    #[test]
    fn test_guid_unique_across_reuse() {
        let id = ServiceId::new("api");
        let first = ServiceGuid::generate(&id);
        let second = ServiceGuid::generate(&id);
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("api-"));
    }

    #[test]
    fn test_default_partition() {
        assert_eq!(PartitionId::default_partition().as_str(), DEFAULT_PARTITION_ID);
        assert!(PartitionId::new("").is_empty());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&ServiceId::new("web")).unwrap();
        assert_eq!(json, "\"web\"");
    }
}

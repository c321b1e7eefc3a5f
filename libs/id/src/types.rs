//! Typed identity for allocation pools.
//!
//! A pool is declared by a registry resource; the registry's namespace and
//! name together form the pool's identity.

use crate::IdError;

/// Separator between namespace and name in the canonical form.
pub const POOL_ID_SEPARATOR: char = '.';

// =============================================================================
// Pool Identity
// =============================================================================

/// Identity of one allocation pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId {
    namespace: String,
    name: String,
}

impl PoolId {
    /// Creates a pool ID from its namespace and registry name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self { namespace, name })
    }

    /// Parses a pool ID from its canonical `{namespace}.{name}` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((namespace, name)) = s.split_once(POOL_ID_SEPARATOR) else {
            return Err(IdError::MissingSeparator);
        };

        Self::new(namespace, name)
    }

    /// Returns the namespace the registry lives in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the registry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_segment(segment: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::InvalidSegment {
            segment,
            reason: "must not be empty",
        });
    }
    if value.contains(POOL_ID_SEPARATOR) {
        return Err(IdError::InvalidSegment {
            segment,
            reason: "must not contain '.'",
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(IdError::InvalidSegment {
            segment,
            reason: "must not contain whitespace",
        });
    }
    Ok(())
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.namespace, POOL_ID_SEPARATOR, self.name)
    }
}

impl std::str::FromStr for PoolId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for PoolId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PoolId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

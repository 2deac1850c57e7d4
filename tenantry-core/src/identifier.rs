//! Schema identifiers.
//!
//! A [`SchemaName`] is a validated tenant identifier. Validation happens once,
//! at construction, so every `SchemaName` in the system is safe to splice into
//! a `search_path` directive.

use std::borrow::Borrow;
use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{TenancyError, TenancyResult};

/// Reserved identifier of the template schema.
pub const TEMPLATE_SCHEMA: &str = "__template__";

/// Maximum length of a tenant identifier.
pub const MAX_SCHEMA_NAME_LEN: usize = 36;

static SCHEMA_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("schema name pattern is valid"));

/// A validated tenant schema identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    /// Validate and wrap an identifier.
    ///
    /// ```rust
    /// use tenantry_core::SchemaName;
    ///
    /// assert!(SchemaName::parse("acme_2").is_ok());
    /// assert!(SchemaName::parse("2acme").is_err());
    /// assert!(SchemaName::parse("__template__").is_err());
    /// ```
    pub fn parse(name: impl Into<String>) -> TenancyResult<Self> {
        let name = name.into();
        if name == TEMPLATE_SCHEMA {
            return Err(TenancyError::reserved_name(name));
        }
        if name.is_empty() {
            return Err(TenancyError::invalid_name(name, "must not be empty"));
        }
        if name.len() > MAX_SCHEMA_NAME_LEN {
            return Err(TenancyError::invalid_name(
                name,
                format!("longer than {} characters", MAX_SCHEMA_NAME_LEN),
            ));
        }
        if !SCHEMA_NAME_PATTERN.is_match(&name) {
            return Err(TenancyError::invalid_name(
                name,
                "must match ^[a-z][a-z0-9_]*$",
            ));
        }
        Ok(Self(name))
    }

    /// Check a string against the naming rule without allocating.
    pub fn is_valid(name: &str) -> bool {
        name != TEMPLATE_SCHEMA
            && name.len() <= MAX_SCHEMA_NAME_LEN
            && SCHEMA_NAME_PATTERN.is_match(name)
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SchemaName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SchemaName {
    type Error = TenancyError;

    fn try_from(value: &str) -> TenancyResult<Self> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SchemaName {
    type Error = TenancyError;

    fn try_from(value: String) -> TenancyResult<Self> {
        Self::parse(value)
    }
}

impl PartialEq<str> for SchemaName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SchemaName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl<'de> Deserialize<'de> for SchemaName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// A schema the connection can be pointed at: the template or a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaRef {
    /// The reserved template schema.
    Template,
    /// A tenant schema.
    Tenant(SchemaName),
}

impl SchemaRef {
    /// Resolve a raw identifier, recognising the template name.
    pub fn parse(name: &str) -> TenancyResult<Self> {
        if name == TEMPLATE_SCHEMA {
            Ok(Self::Template)
        } else {
            SchemaName::parse(name).map(Self::Tenant)
        }
    }

    /// The physical schema name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Template => TEMPLATE_SCHEMA,
            Self::Tenant(name) => name.as_str(),
        }
    }

    /// Check if this is the template.
    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template)
    }

    /// The tenant name, if this is a tenant.
    pub fn tenant(&self) -> Option<&SchemaName> {
        match self {
            Self::Template => None,
            Self::Tenant(name) => Some(name),
        }
    }
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SchemaName> for SchemaRef {
    fn from(name: SchemaName) -> Self {
        Self::Tenant(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_valid_names() {
        let longest = "x".repeat(MAX_SCHEMA_NAME_LEN);
        for name in ["a", "acme", "acme_2", "z9", "a_b_c", longest.as_str()] {
            assert!(SchemaName::parse(name).is_ok(), "{name} should be valid");
            assert!(SchemaName::is_valid(name));
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "x".repeat(MAX_SCHEMA_NAME_LEN + 1);
        for name in ["", "9lives", "_hidden", "has-dash", "Upper", "spa ce", too_long.as_str()] {
            let err = SchemaName::parse(name).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidSchemaName, "{name}");
            assert!(!SchemaName::is_valid(name));
        }
    }

    #[test]
    fn test_template_is_reserved() {
        let err = SchemaName::parse(TEMPLATE_SCHEMA).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReservedSchemaName);
        assert!(err.is_validation());
    }

    #[test]
    fn test_schema_ref_parse() {
        assert_eq!(SchemaRef::parse(TEMPLATE_SCHEMA).unwrap(), SchemaRef::Template);
        let tenant = SchemaRef::parse("acme").unwrap();
        assert_eq!(tenant.as_str(), "acme");
        assert!(!tenant.is_template());
        assert!(SchemaRef::parse("Acme").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        #[derive(Deserialize)]
        struct Wrapper {
            name: SchemaName,
        }

        let ok: Wrapper = toml::from_str("name = \"acme\"").unwrap();
        assert_eq!(ok.name, "acme");
        assert!(toml::from_str::<Wrapper>("name = \"ACME\"").is_err());
    }
}

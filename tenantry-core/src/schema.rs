//! Tenant schema entity.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::identifier::{SchemaName, SchemaRef};

/// Reference to an application user.
pub type UserId = i64;

/// A registered tenant schema.
///
/// `name` is public so callers can edit a loaded value, but the registry
/// refuses to save a value whose name differs from the persisted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Identifier, also the physical schema name.
    pub name: SchemaName,
    /// Unique human readable name.
    pub display_name: String,
    /// Inactive schemas keep their data but cannot be selected by
    /// unprivileged users.
    pub is_active: bool,
    /// Users allowed to select this schema.
    pub users: BTreeSet<UserId>,
    /// Creation time; registry listings are ordered by it.
    pub created_at: DateTime<Utc>,
    persisted_name: Option<SchemaName>,
}

impl Schema {
    /// Rebuild a schema loaded from storage.
    pub fn restore(
        name: SchemaName,
        display_name: impl Into<String>,
        is_active: bool,
        users: impl IntoIterator<Item = UserId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            persisted_name: Some(name.clone()),
            name,
            display_name: display_name.into(),
            is_active,
            users: users.into_iter().collect(),
            created_at,
        }
    }

    pub(crate) fn unsaved(new: &NewSchema, name: SchemaName, display_name: String) -> Self {
        Self {
            name,
            display_name,
            is_active: new.is_active,
            users: new.users.clone(),
            created_at: Utc::now(),
            persisted_name: None,
        }
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted_name = Some(self.name.clone());
    }

    /// Identifier as stored, if this value came from storage.
    pub fn persisted_name(&self) -> Option<&SchemaName> {
        self.persisted_name.as_ref()
    }

    /// Check if the user may select this schema without privileges.
    pub fn admits(&self, user: UserId) -> bool {
        self.is_active && self.users.contains(&user)
    }

    /// This schema as a search path target.
    pub fn schema_ref(&self) -> SchemaRef {
        SchemaRef::Tenant(self.name.clone())
    }
}

/// Parameters for creating a schema.
#[derive(Debug, Clone)]
pub struct NewSchema {
    /// Requested identifier, validated on create.
    pub name: String,
    /// Display name; defaults to the identifier.
    pub display_name: Option<String>,
    /// Initial active flag.
    pub is_active: bool,
    /// Initially authorized users.
    pub users: BTreeSet<UserId>,
    /// Schema whose structure and rows are cloned; defaults to the template.
    pub clone_from: Option<SchemaRef>,
}

impl NewSchema {
    /// An active schema with no users, cloned from the template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            is_active: true,
            users: BTreeSet::new(),
            clone_from: None,
        }
    }

    /// Set the display name.
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Create the schema inactive.
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Authorize a user.
    pub fn user(mut self, user: UserId) -> Self {
        self.users.insert(user);
        self
    }

    /// Clone from another schema instead of the template.
    pub fn clone_from(mut self, source: SchemaRef) -> Self {
        self.clone_from = Some(source);
        self
    }

    /// The clone source.
    pub fn source(&self) -> SchemaRef {
        self.clone_from.clone().unwrap_or(SchemaRef::Template)
    }
}

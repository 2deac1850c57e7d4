//! Table classification.
//!
//! Every table is either shared (one copy in the public schema) or
//! tenant-scoped (one copy per tenant schema and in the template). The scope
//! is declared statically, either on an [`Entity`] type or by name through
//! configuration, and never changes at runtime.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::config::TenancyConfig;
use crate::context::ActiveSchema;
use crate::error::{TenancyError, TenancyResult};
use crate::identifier::SchemaName;

/// Table holding registry rows.
pub const SCHEMA_TABLE: &str = "tenantry_schema";

/// Unique constraint on registry display names.
pub const DISPLAY_NAME_CONSTRAINT: &str = "tenantry_schema_display_name_key";

/// Table linking registry rows to authorized users.
pub const SCHEMA_USERS_TABLE: &str = "tenantry_schema_users";

/// Where a table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableScope {
    /// One copy, in the public schema.
    Shared,
    /// One copy per tenant schema and in the template.
    Tenant,
}

/// A persisted entity type with a statically declared scope.
///
/// ```rust
/// use tenantry_core::{Entity, TableScope};
///
/// struct Invoice {
///     id: i64,
/// }
///
/// impl Entity for Invoice {
///     type Key = i64;
///     const TABLE: &'static str = "invoices";
///     const SCOPE: TableScope = TableScope::Tenant;
///
///     fn key(&self) -> i64 {
///         self.id
///     }
/// }
/// ```
pub trait Entity {
    /// Primary key type.
    type Key: Clone + Eq + Hash + Debug;

    /// Table name.
    const TABLE: &'static str;

    /// Table scope.
    const SCOPE: TableScope;

    /// Primary key of this instance.
    fn key(&self) -> Self::Key;
}

/// Identity of a loaded entity.
///
/// Tenant-scoped rows in different schemas may share a primary key, so their
/// identity includes the owning schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey<K> {
    /// A shared row.
    Shared(K),
    /// A row owned by a tenant schema.
    Tenant {
        /// Owning schema.
        schema: SchemaName,
        /// Primary key within that schema.
        key: K,
    },
}

/// An entity instance together with the schema it was loaded from.
#[derive(Debug, Clone)]
pub struct Record<E> {
    entity: E,
    schema: Option<SchemaName>,
}

impl<E: Entity> Record<E> {
    /// Wrap an entity loaded under the given active schema.
    ///
    /// Loading a tenant-scoped entity requires an active tenant schema.
    pub fn load(entity: E, active: &ActiveSchema) -> TenancyResult<Self> {
        let schema = match E::SCOPE {
            TableScope::Shared => None,
            TableScope::Tenant => match active.tenant() {
                Some(name) => Some(name.clone()),
                None => return Err(TenancyError::selection_required()),
            },
        };
        Ok(Self { entity, schema })
    }

    /// Wrap an entity owned by a known schema.
    pub fn owned_by(entity: E, schema: SchemaName) -> Self {
        let schema = match E::SCOPE {
            TableScope::Shared => None,
            TableScope::Tenant => Some(schema),
        };
        Self { entity, schema }
    }

    /// Composite identity used for equality and hashing.
    pub fn identity(&self) -> EntityKey<E::Key> {
        match &self.schema {
            Some(schema) => EntityKey::Tenant {
                schema: schema.clone(),
                key: self.entity.key(),
            },
            None => EntityKey::Shared(self.entity.key()),
        }
    }

    /// Owning schema for tenant-scoped entities.
    pub fn schema(&self) -> Option<&SchemaName> {
        self.schema.as_ref()
    }

    /// The wrapped entity.
    pub fn entity(&self) -> &E {
        &self.entity
    }

    /// Unwrap the entity.
    pub fn into_inner(self) -> E {
        self.entity
    }
}

impl<E: Entity> PartialEq for Record<E> {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl<E: Entity> Eq for Record<E> {}

impl<E: Entity> Hash for Record<E> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// Scope lookup by table name.
///
/// Tables that were never declared are tenant-scoped. The registry's own
/// tables are always shared.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: HashMap<String, TableScope>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        let mut tables = HashMap::new();
        tables.insert(SCHEMA_TABLE.to_string(), TableScope::Shared);
        tables.insert(SCHEMA_USERS_TABLE.to_string(), TableScope::Shared);
        Self { tables }
    }
}

impl TableRegistry {
    /// Create a registry holding only the built-in shared tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the configured shared tables.
    pub fn from_config(config: &TenancyConfig) -> TenancyResult<Self> {
        let mut registry = Self::new();
        for table in &config.shared_tables {
            registry.register(table, TableScope::Shared)?;
        }
        Ok(registry)
    }

    /// Declare the scope of a table.
    ///
    /// Declaring the same table twice with the same scope is allowed; with a
    /// different scope it is a configuration error.
    pub fn register(&mut self, table: &str, scope: TableScope) -> TenancyResult<()> {
        let table = normalize(table);
        match self.tables.get(&table) {
            Some(existing) if *existing != scope => Err(TenancyError::conflicting_scope(table)),
            Some(_) => Ok(()),
            None => {
                self.tables.insert(table, scope);
                Ok(())
            }
        }
    }

    /// Declare the scope of an entity's table.
    pub fn register_entity<E: Entity>(&mut self) -> TenancyResult<()> {
        self.register(E::TABLE, E::SCOPE)
    }

    /// Builder form of [`register`](Self::register) for shared tables.
    pub fn shared(mut self, table: &str) -> TenancyResult<Self> {
        self.register(table, TableScope::Shared)?;
        Ok(self)
    }

    /// Builder form of [`register`](Self::register) for tenant tables.
    pub fn tenant(mut self, table: &str) -> TenancyResult<Self> {
        self.register(table, TableScope::Tenant)?;
        Ok(self)
    }

    /// The declared scope, if any.
    ///
    /// `table` is compared as given, the way the classifier reports it.
    pub fn scope_of(&self, table: &str) -> Option<TableScope> {
        self.tables.get(table).copied()
    }

    /// Check if the table is shared.
    pub fn is_shared(&self, table: &str) -> bool {
        self.scope_of(table) == Some(TableScope::Shared)
    }
}

// Declared names read like SQL: quoted ones keep their case, unquoted ones fold.
fn normalize(table: &str) -> String {
    match table
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => table.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone)]
    struct Widget {
        id: i64,
    }

    impl Entity for Widget {
        type Key = i64;
        const TABLE: &'static str = "widgets";
        const SCOPE: TableScope = TableScope::Tenant;

        fn key(&self) -> i64 {
            self.id
        }
    }

    #[derive(Debug, Clone)]
    struct Account {
        id: i64,
    }

    impl Entity for Account {
        type Key = i64;
        const TABLE: &'static str = "accounts";
        const SCOPE: TableScope = TableScope::Shared;

        fn key(&self) -> i64 {
            self.id
        }
    }

    fn schema(name: &str) -> SchemaName {
        SchemaName::parse(name).unwrap()
    }

    #[test]
    fn test_builtin_tables_are_shared() {
        let registry = TableRegistry::new();
        assert!(registry.is_shared(SCHEMA_TABLE));
        assert!(registry.is_shared(SCHEMA_USERS_TABLE));
        assert!(!registry.is_shared("widgets"));
        assert_eq!(registry.scope_of("widgets"), None);
    }

    #[test]
    fn test_conflicting_scope_rejected() {
        let mut registry = TableRegistry::new();
        registry.register_entity::<Widget>().unwrap();
        registry.register("widgets", TableScope::Tenant).unwrap();

        let err = registry.register("WIDGETS", TableScope::Shared).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ConflictingTableScope);
    }

    #[test]
    fn test_quoted_names_keep_case() {
        let mut registry = TableRegistry::new();
        registry.register("\"MixedCase\"", TableScope::Shared).unwrap();
        registry.register("MixedCase", TableScope::Tenant).unwrap();

        assert!(registry.is_shared("MixedCase"));
        assert_eq!(registry.scope_of("mixedcase"), Some(TableScope::Tenant));
    }

    #[test]
    fn test_from_config() {
        let config = TenancyConfig::default().with_shared_table("Accounts");
        let registry = TableRegistry::from_config(&config).unwrap();
        assert!(registry.is_shared("accounts"));
    }

    #[test]
    fn test_same_key_different_schema_not_equal() {
        let a = Record::owned_by(Widget { id: 1 }, schema("a"));
        let b = Record::owned_by(Widget { id: 1 }, schema("b"));
        let a_again = Record::owned_by(Widget { id: 1 }, schema("a"));

        assert_ne!(a, b);
        assert_eq!(a, a_again);

        let set: HashSet<_> = [a, b, a_again].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_shared_identity_ignores_schema() {
        let a = Record::owned_by(Account { id: 7 }, schema("a"));
        let b = Record::owned_by(Account { id: 7 }, schema("b"));
        assert_eq!(a, b);
        assert_eq!(a.identity(), EntityKey::Shared(7));
    }

    #[test]
    fn test_load_requires_active_tenant() {
        let inactive = ActiveSchema::None;
        assert!(Record::load(Widget { id: 1 }, &inactive).is_err());
        assert!(Record::load(Account { id: 1 }, &inactive).is_ok());

        let active = ActiveSchema::Tenant(schema("a"));
        let record = Record::load(Widget { id: 1 }, &active).unwrap();
        assert_eq!(record.schema(), Some(&schema("a")));
    }
}

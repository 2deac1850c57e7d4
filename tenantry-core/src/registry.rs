//! Schema registry.
//!
//! The registry owns the tenant schema lifecycle: identifier validation,
//! uniqueness, clone-on-create and drop-on-delete. Persistence goes through a
//! [`SchemaStore`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{TenancyError, TenancyResult};
use crate::events::{NoEvents, SchemaEvents};
use crate::identifier::{SchemaName, SchemaRef, TEMPLATE_SCHEMA};
use crate::schema::{NewSchema, Schema, UserId};
use crate::tables::DISPLAY_NAME_CONSTRAINT;

/// Storage for registry rows and the physical schemas they describe.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Clone `source` into a new physical schema named after `schema` and
    /// insert its row, atomically.
    ///
    /// A concurrent creator of the same identifier must make one of the two
    /// calls fail with a unique violation.
    async fn create(&self, schema: &Schema, source: &SchemaRef) -> TenancyResult<()>;

    /// Persist the mutable fields of an existing row.
    async fn update(&self, schema: &Schema) -> TenancyResult<()>;

    /// Drop the physical schema and delete its row, atomically.
    async fn delete(&self, name: &SchemaName) -> TenancyResult<()>;

    /// Load a row by identifier.
    async fn get(&self, name: &str) -> TenancyResult<Option<Schema>>;

    /// Load a row by display name.
    async fn find_by_display_name(&self, display_name: &str) -> TenancyResult<Option<Schema>>;

    /// All rows in creation order.
    async fn list(&self) -> TenancyResult<Vec<Schema>>;

    /// Rows the user is authorized for, in creation order.
    async fn list_for_user(&self, user: UserId) -> TenancyResult<Vec<Schema>>;

    /// Check if a physical schema exists, registered or not.
    async fn schema_exists(&self, name: &str) -> TenancyResult<bool>;
}

#[async_trait]
impl<S: SchemaStore + ?Sized> SchemaStore for Arc<S> {
    async fn create(&self, schema: &Schema, source: &SchemaRef) -> TenancyResult<()> {
        (**self).create(schema, source).await
    }

    async fn update(&self, schema: &Schema) -> TenancyResult<()> {
        (**self).update(schema).await
    }

    async fn delete(&self, name: &SchemaName) -> TenancyResult<()> {
        (**self).delete(name).await
    }

    async fn get(&self, name: &str) -> TenancyResult<Option<Schema>> {
        (**self).get(name).await
    }

    async fn find_by_display_name(&self, display_name: &str) -> TenancyResult<Option<Schema>> {
        (**self).find_by_display_name(display_name).await
    }

    async fn list(&self) -> TenancyResult<Vec<Schema>> {
        (**self).list().await
    }

    async fn list_for_user(&self, user: UserId) -> TenancyResult<Vec<Schema>> {
        (**self).list_for_user(user).await
    }

    async fn schema_exists(&self, name: &str) -> TenancyResult<bool> {
        (**self).schema_exists(name).await
    }
}

/// Catalog of tenant schemas.
pub struct SchemaRegistry<S> {
    store: S,
    events: Arc<dyn SchemaEvents>,
}

impl<S: SchemaStore> SchemaRegistry<S> {
    /// Create a registry over a store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            events: Arc::new(NoEvents),
        }
    }

    /// Notify the given hooks of lifecycle changes.
    pub fn with_events(mut self, events: Arc<dyn SchemaEvents>) -> Self {
        self.events = events;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lifecycle hooks.
    pub fn events(&self) -> &Arc<dyn SchemaEvents> {
        &self.events
    }

    /// Create a schema by cloning its source and registering it.
    pub async fn create(&self, new: NewSchema) -> TenancyResult<Schema> {
        let name = SchemaName::parse(new.name.as_str())?;
        let display_name = match &new.display_name {
            Some(display) if display.trim().is_empty() => {
                return Err(TenancyError::new(
                    crate::ErrorCode::InvalidSchemaName,
                    "Display name must not be empty",
                )
                .with_schema(name.as_str()));
            }
            Some(display) => display.clone(),
            None => name.to_string(),
        };

        if self.store.get(name.as_str()).await?.is_some() {
            return Err(TenancyError::duplicate_name(name.as_str()));
        }
        if self.store.find_by_display_name(&display_name).await?.is_some() {
            return Err(TenancyError::duplicate_display_name(display_name));
        }
        if self.store.schema_exists(name.as_str()).await? {
            return Err(TenancyError::duplicate_name(name.as_str())
                .with_help("A physical schema with this name exists outside the registry"));
        }

        let source = new.source();
        if let SchemaRef::Tenant(source_name) = &source {
            if self.store.get(source_name.as_str()).await?.is_none() {
                return Err(TenancyError::not_found(source_name.as_str())
                    .with_operation("resolving clone source"));
            }
        }

        let mut schema = Schema::unsaved(&new, name, display_name);
        self.store
            .create(&schema, &source)
            .await
            .map_err(|e| creation_conflict(&schema, e))?;
        schema.mark_persisted();

        info!(schema = %schema.name, source = %source, "Schema created");
        self.events.schema_created(&schema).await;
        Ok(schema)
    }

    /// Create one schema per identifier, display name equal to identifier.
    pub async fn bulk_create<I>(&self, names: I) -> TenancyResult<Vec<Schema>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut created = Vec::new();
        for name in names {
            created.push(self.create(NewSchema::new(name.as_ref())).await?);
        }
        Ok(created)
    }

    /// Load a schema, failing if it is not registered.
    pub async fn get(&self, name: &str) -> TenancyResult<Schema> {
        self.find(name)
            .await?
            .ok_or_else(|| TenancyError::not_found(name))
    }

    /// Load a schema if registered. The template is never registered.
    pub async fn find(&self, name: &str) -> TenancyResult<Option<Schema>> {
        if !SchemaName::is_valid(name) {
            return Ok(None);
        }
        self.store.get(name).await
    }

    /// All schemas in creation order.
    pub async fn list(&self) -> TenancyResult<Vec<Schema>> {
        self.store.list().await
    }

    /// Schemas the user is authorized for, in creation order.
    pub async fn schemata_for(&self, user: UserId) -> TenancyResult<Vec<Schema>> {
        self.store.list_for_user(user).await
    }

    /// Persist changes to a loaded schema.
    ///
    /// The identifier cannot change once persisted.
    pub async fn save(&self, schema: &Schema) -> TenancyResult<()> {
        let persisted = schema.persisted_name().ok_or_else(|| {
            TenancyError::not_found(schema.name.as_str())
                .with_help("Use SchemaRegistry::create for new schemas")
        })?;
        if *persisted != schema.name {
            return Err(TenancyError::immutable_name(
                persisted.as_str(),
                schema.name.as_str(),
            ));
        }
        if schema.display_name.trim().is_empty() {
            return Err(TenancyError::new(
                crate::ErrorCode::InvalidSchemaName,
                "Display name must not be empty",
            )
            .with_schema(schema.name.as_str()));
        }
        if let Some(other) = self.store.find_by_display_name(&schema.display_name).await? {
            if other.name != schema.name {
                return Err(TenancyError::duplicate_display_name(&schema.display_name));
            }
        }

        self.store.update(schema).await.map_err(|e| {
            if e.is_unique_violation() {
                TenancyError::duplicate_display_name(&schema.display_name).with_source(e)
            } else {
                e
            }
        })?;
        debug!(schema = %schema.name, "Schema saved");
        Ok(())
    }

    /// Drop a schema and unregister it. The template can never be deleted.
    pub async fn delete(&self, name: &str) -> TenancyResult<()> {
        if name == TEMPLATE_SCHEMA {
            return Err(TenancyError::reserved_name(name).with_operation("deleting schema"));
        }
        let schema = self.get(name).await?;
        self.store.delete(&schema.name).await?;

        info!(schema = %schema.name, "Schema deleted");
        self.events.schema_deleted(&schema.name).await;
        Ok(())
    }

    /// Authorize a user for a schema.
    pub async fn grant(&self, name: &str, user: UserId) -> TenancyResult<Schema> {
        let mut schema = self.get(name).await?;
        if schema.users.insert(user) {
            self.save(&schema).await?;
        }
        Ok(schema)
    }

    /// Revoke a user's authorization for a schema.
    pub async fn revoke(&self, name: &str, user: UserId) -> TenancyResult<Schema> {
        let mut schema = self.get(name).await?;
        if schema.users.remove(&user) {
            self.save(&schema).await?;
        }
        Ok(schema)
    }
}

/// Map a store error raised by a concurrent creator to a validation error.
fn creation_conflict(schema: &Schema, err: TenancyError) -> TenancyError {
    if !err.is_unique_violation() {
        return err.with_operation("creating schema");
    }
    if err.context.constraint.as_deref() == Some(DISPLAY_NAME_CONSTRAINT) {
        TenancyError::duplicate_display_name(&schema.display_name).with_source(err)
    } else {
        TenancyError::duplicate_name(schema.name.as_str()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::memory::MemoryDatabase;
    use crate::identifier::MAX_SCHEMA_NAME_LEN;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    async fn registry() -> (MemoryDatabase, SchemaRegistry<MemoryDatabase>) {
        let db = MemoryDatabase::new();
        db.execute_in(TEMPLATE_SCHEMA, "CREATE TABLE widgets (id int, name text)")
            .unwrap();
        (db.clone(), SchemaRegistry::new(db))
    }

    #[tokio::test]
    async fn test_valid_identifiers_create() {
        let (_, registry) = registry().await;
        let longest = "a".repeat(MAX_SCHEMA_NAME_LEN);
        for name in ["a", "acme", "acme_2", "x9_", longest.as_str()] {
            let schema = registry.create(NewSchema::new(name)).await.unwrap();
            assert_eq!(schema.name, name);
            assert_eq!(schema.display_name, name);
            assert!(schema.is_active);
        }
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let (db, registry) = registry().await;
        let too_long = "a".repeat(MAX_SCHEMA_NAME_LEN + 1);
        for name in ["1abc", "_abc", "ab-c", "Abc", "", too_long.as_str(), TEMPLATE_SCHEMA] {
            let err = registry.create(NewSchema::new(name)).await.unwrap_err();
            assert!(err.is_validation(), "{name}: {err}");
        }
        assert!(registry.list().await.unwrap().is_empty());
        assert_eq!(db.schemas(), vec!["__template__".to_string(), "public".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_and_display_name() {
        let (_, registry) = registry().await;
        registry
            .create(NewSchema::new("acme").display_name("Acme"))
            .await
            .unwrap();

        let err = registry
            .create(NewSchema::new("acme").display_name("Other"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateSchemaName);

        let err = registry
            .create(NewSchema::new("acme2").display_name("Acme"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateDisplayName);
        assert!(err.is_validation());
    }

    /// Store whose reads never see committed rows, as a creator racing
    /// another one would observe.
    struct RacingStore(MemoryDatabase);

    #[async_trait]
    impl SchemaStore for RacingStore {
        async fn create(&self, schema: &Schema, source: &SchemaRef) -> TenancyResult<()> {
            self.0.create(schema, source).await
        }

        async fn update(&self, schema: &Schema) -> TenancyResult<()> {
            self.0.update(schema).await
        }

        async fn delete(&self, name: &SchemaName) -> TenancyResult<()> {
            self.0.delete(name).await
        }

        async fn get(&self, _name: &str) -> TenancyResult<Option<Schema>> {
            Ok(None)
        }

        async fn find_by_display_name(&self, _display_name: &str) -> TenancyResult<Option<Schema>> {
            Ok(None)
        }

        async fn list(&self) -> TenancyResult<Vec<Schema>> {
            self.0.list().await
        }

        async fn list_for_user(&self, user: UserId) -> TenancyResult<Vec<Schema>> {
            self.0.list_for_user(user).await
        }

        async fn schema_exists(&self, _name: &str) -> TenancyResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_losing_concurrent_create_is_validation_error() {
        let registry = SchemaRegistry::new(RacingStore(MemoryDatabase::new()));
        registry
            .create(NewSchema::new("acme").display_name("Acme"))
            .await
            .unwrap();

        let err = registry
            .create(NewSchema::new("acme").display_name("Other"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.code, ErrorCode::DuplicateSchemaName);

        let err = registry
            .create(NewSchema::new("acme2").display_name("Acme"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.code, ErrorCode::DuplicateDisplayName);

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identifier_is_immutable() {
        let (_, registry) = registry().await;
        let mut schema = registry.create(NewSchema::new("foo")).await.unwrap();

        schema.name = SchemaName::parse("bar").unwrap();
        let err = registry.save(&schema).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaNameImmutable);
        assert!(err.is_validation());

        let mut schema = registry.get("foo").await.unwrap();
        schema.display_name = "Foo Inc".into();
        registry.save(&schema).await.unwrap();
        assert_eq!(registry.get("foo").await.unwrap().display_name, "Foo Inc");
        assert!(registry.find("bar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_rejects_taken_display_name() {
        let (_, registry) = registry().await;
        registry.create(NewSchema::new("a").display_name("A")).await.unwrap();
        let mut b = registry.create(NewSchema::new("b").display_name("B")).await.unwrap();

        b.display_name = "A".into();
        let err = registry.save(&b).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateDisplayName);
    }

    #[tokio::test]
    async fn test_clone_copies_template_tables() {
        let (db, registry) = registry().await;
        registry.create(NewSchema::new("dup")).await.unwrap();
        assert_eq!(db.tables("dup"), db.tables(TEMPLATE_SCHEMA));
        assert_eq!(db.tables("dup"), vec!["widgets".to_string()]);
    }

    #[tokio::test]
    async fn test_clone_from_other_schema() {
        let (db, registry) = registry().await;
        registry.create(NewSchema::new("source")).await.unwrap();
        db.execute_in("source", "CREATE TABLE extra (id int)").unwrap();

        let source = SchemaRef::parse("source").unwrap();
        registry
            .create(NewSchema::new("copy").clone_from(source))
            .await
            .unwrap();
        assert_eq!(db.tables("copy"), vec!["extra".to_string(), "widgets".to_string()]);

        let missing = SchemaRef::parse("missing").unwrap();
        let err = registry
            .create(NewSchema::new("copy2").clone_from(missing))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_, registry) = registry().await;
        assert!(registry.get("nope").await.unwrap_err().is_not_found());
        assert!(registry.get(TEMPLATE_SCHEMA).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_drops_schema() {
        let (db, registry) = registry().await;
        registry.create(NewSchema::new("gone")).await.unwrap();
        registry.delete("gone").await.unwrap();

        assert!(registry.find("gone").await.unwrap().is_none());
        assert!(!db.schemas().contains(&"gone".to_string()));

        let err = registry.delete(TEMPLATE_SCHEMA).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ReservedSchemaName);
        assert!(db.schemas().contains(&TEMPLATE_SCHEMA.to_string()));
    }

    #[tokio::test]
    async fn test_bulk_create_in_order() {
        let (_, registry) = registry().await;
        registry.bulk_create(["c", "a", "b"]).await.unwrap();
        let names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name.into_inner())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let (_, registry) = registry().await;
        registry.bulk_create(["a", "b"]).await.unwrap();
        registry.grant("a", 7).await.unwrap();
        registry.grant("b", 7).await.unwrap();
        registry.revoke("b", 7).await.unwrap();

        let mine = registry.schemata_for(7).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "a");
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SchemaEvents for Recorder {
        async fn schema_created(&self, schema: &Schema) {
            self.seen.lock().push(format!("created {}", schema.name));
        }

        async fn schema_deleted(&self, name: &SchemaName) {
            self.seen.lock().push(format!("deleted {}", name));
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let recorder = Arc::new(Recorder::default());
        let registry = SchemaRegistry::new(MemoryDatabase::new()).with_events(recorder.clone());

        registry.create(NewSchema::new("acme")).await.unwrap();
        registry.delete("acme").await.unwrap();

        assert_eq!(
            *recorder.seen.lock(),
            vec!["created acme".to_string(), "deleted acme".to_string()]
        );
    }
}

//! Migration fan-out.
//!
//! Schema-modifying statements pass through a [`SchemaEditor`] on their way
//! to the connection. Each one is classified; a statement that targets a
//! tenant table without naming a schema is replayed in the template and then
//! in every registered schema, in creation order. Everything else runs once
//! against the active schema.
//!
//! ```rust,no_run
//! use tenantry_core::{
//!     MemoryDatabase, SchemaEditor, SchemaRegistry, SchemaSession, TableRegistry, TenancyConfig,
//! };
//! use tenantry_core::connection::ConnectionSource;
//!
//! # async fn run() -> tenantry_core::TenancyResult<()> {
//! let db = MemoryDatabase::new();
//! let config = TenancyConfig::default();
//! let registry = SchemaRegistry::new(db.clone());
//! let tables = TableRegistry::from_config(&config)?;
//! let mut session = SchemaSession::new(db.acquire().await?, &config);
//!
//! let mut editor = SchemaEditor::new(&mut session, &registry, &tables);
//! editor.apply_atomic("ALTER TABLE widgets ADD COLUMN colour text;").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::classify::{StatementTarget, classify, split_statements};
use crate::connection::SchemaConnection;
use crate::context::{ActiveSchema, SchemaSession};
use crate::error::TenancyResult;
use crate::identifier::{SchemaRef, TEMPLATE_SCHEMA};
use crate::registry::{SchemaRegistry, SchemaStore};
use crate::tables::TableRegistry;

/// How a statement is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Once, against the active schema.
    Once,
    /// In the template and every registered schema.
    FanOut {
        /// The tenant table the statement targets.
        table: String,
    },
}

impl Routing {
    /// Check if the statement fans out.
    pub fn is_fan_out(&self) -> bool {
        matches!(self, Self::FanOut { .. })
    }
}

/// Decide how a classified statement runs.
///
/// Only an unqualified statement against a tenant table fans out.
pub fn decide(target: &StatementTarget, tables: &TableRegistry) -> Routing {
    match (&target.table, &target.schema) {
        (Some(table), None) if !tables.is_shared(table) => Routing::FanOut {
            table: table.clone(),
        },
        _ => Routing::Once,
    }
}

/// Outcome of applying a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptReport {
    /// Statements run once.
    pub executed: usize,
    /// Statements replayed across schemas.
    pub fanned_out: usize,
    /// Deferred statements flushed at the end.
    pub deferred: usize,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl ScriptReport {
    /// Total statements processed.
    pub fn total(&self) -> usize {
        self.executed + self.fanned_out + self.deferred
    }

    /// Get a summary of the report.
    pub fn summary(&self) -> String {
        if self.total() == 0 {
            return "No statements applied".to_string();
        }
        let mut parts = Vec::new();
        if self.executed > 0 {
            parts.push(format!("{} executed once", self.executed));
        }
        if self.fanned_out > 0 {
            parts.push(format!("{} fanned out", self.fanned_out));
        }
        if self.deferred > 0 {
            parts.push(format!("{} deferred", self.deferred));
        }
        format!("{} in {}ms", parts.join(", "), self.duration_ms)
    }

    fn record(&mut self, routing: &Routing) {
        if routing.is_fan_out() {
            self.fanned_out += 1;
        } else {
            self.executed += 1;
        }
    }
}

/// The choke point a migration pipeline sends raw statements through.
#[async_trait]
pub trait MigrationExecutor: Send {
    /// Execute a statement, fanning out where needed.
    async fn execute(&mut self, sql: &str) -> TenancyResult<Routing>;

    /// Queue a statement for the end of the migration step.
    ///
    /// Returns `false` if an identical statement is already queued.
    fn defer(&mut self, sql: &str) -> bool;

    /// Execute and clear queued statements in first-seen order.
    async fn flush(&mut self) -> TenancyResult<usize>;
}

/// Routes migration statements for one session.
pub struct SchemaEditor<'a, C, S> {
    session: &'a mut SchemaSession<C>,
    registry: &'a SchemaRegistry<S>,
    tables: &'a TableRegistry,
    deferred: IndexSet<String>,
}

impl<'a, C, S> SchemaEditor<'a, C, S>
where
    C: SchemaConnection,
    S: SchemaStore,
{
    /// Create an editor over a session.
    pub fn new(
        session: &'a mut SchemaSession<C>,
        registry: &'a SchemaRegistry<S>,
        tables: &'a TableRegistry,
    ) -> Self {
        Self {
            session,
            registry,
            tables,
            deferred: IndexSet::new(),
        }
    }

    /// The session statements run on.
    pub fn session(&self) -> &SchemaSession<C> {
        self.session
    }

    /// Classify a statement and decide its routing.
    pub async fn route(&self, sql: &str) -> TenancyResult<Routing> {
        let search = [TEMPLATE_SCHEMA, self.session.public_schema()];
        let target = classify(sql, self.session.connection(), &search).await?;
        Ok(decide(&target, self.tables))
    }

    /// Fan-out targets: the template, then registered schemas by creation.
    pub async fn targets(&self) -> TenancyResult<Vec<SchemaRef>> {
        let mut targets = vec![SchemaRef::Template];
        targets.extend(
            self.registry
                .list()
                .await?
                .into_iter()
                .map(|schema| SchemaRef::Tenant(schema.name)),
        );
        Ok(targets)
    }

    /// Execute a statement, fanning out where needed.
    ///
    /// The active schema is the same afterwards as before.
    pub async fn execute(&mut self, sql: &str) -> TenancyResult<Routing> {
        let routing = self.route(sql).await?;
        match &routing {
            Routing::Once => self.run(sql).await?,
            Routing::FanOut { table } => {
                debug!(table = %table, "Fanning out statement");
                self.fan_out(sql).await?;
            }
        }
        Ok(routing)
    }

    /// Execute a statement with `schema` active, then restore the previous
    /// schema.
    pub async fn execute_in(&mut self, schema: &SchemaRef, sql: &str) -> TenancyResult<()> {
        let previous = self.session.current().clone();
        let result = self.run_in(schema, sql).await;
        self.restore(previous, result).await
    }

    async fn fan_out(&mut self, sql: &str) -> TenancyResult<()> {
        let previous = self.session.current().clone();
        let targets = self.targets().await?;

        let mut result = Ok(());
        for target in &targets {
            result = self.run_in(target, sql).await;
            if result.is_err() {
                break;
            }
        }
        self.restore(previous, result).await
    }

    async fn run_in(&mut self, schema: &SchemaRef, sql: &str) -> TenancyResult<()> {
        debug!(schema = %schema, "Executing in schema");
        self.session.switch(ActiveSchema::from(schema.clone())).await?;
        self.run(sql).await
    }

    async fn run(&self, sql: &str) -> TenancyResult<()> {
        self.session.connection().batch_execute(sql).await.map_err(|e| {
            let e = e.with_sql(sql);
            match self.session.current() {
                ActiveSchema::None => e,
                active => e.with_schema(active.to_string()),
            }
        })
    }

    /// Put the previous schema back. A failed restore after a failed
    /// statement is logged and the statement's error returned.
    async fn restore(
        &mut self,
        previous: ActiveSchema,
        result: TenancyResult<()>,
    ) -> TenancyResult<()> {
        if *self.session.current() == previous {
            return result;
        }
        let restored = self.session.switch(previous).await;
        match (result, restored) {
            (Err(e), Err(restore)) => {
                warn!(error = %restore, "Failed to restore active schema after fan-out error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), restored) => restored,
        }
    }

    /// Queue a statement for the end of the step.
    pub fn defer(&mut self, sql: impl Into<String>) -> bool {
        self.deferred.insert(sql.into())
    }

    /// Queued statements in first-seen order.
    pub fn deferred(&self) -> impl Iterator<Item = &str> {
        self.deferred.iter().map(String::as_str)
    }

    /// Execute and clear queued statements.
    pub async fn flush(&mut self) -> TenancyResult<usize> {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for sql in &deferred {
            self.execute(sql).await?;
        }
        Ok(count)
    }

    /// Split a script and execute each statement.
    pub async fn apply_script(&mut self, script: &str) -> TenancyResult<ScriptReport> {
        let start = Instant::now();
        let mut report = ScriptReport::default();
        for statement in split_statements(script) {
            let routing = self.execute(&statement).await?;
            report.record(&routing);
        }
        report.duration_ms = start.elapsed().as_millis() as i64;
        Ok(report)
    }

    /// Apply a script and flush deferred statements inside one transaction.
    ///
    /// On failure the transaction is rolled back and the first error returned.
    pub async fn apply_atomic(&mut self, script: &str) -> TenancyResult<ScriptReport> {
        let start = Instant::now();
        let previous = self.session.current().clone();
        self.session.connection().begin().await?;

        let result = async {
            let mut report = self.apply_script(script).await?;
            report.deferred = self.flush().await?;
            Ok::<_, crate::error::TenancyError>(report)
        }
        .await;

        match result {
            Ok(mut report) => {
                self.session.connection().commit().await?;
                report.duration_ms = start.elapsed().as_millis() as i64;
                debug!(summary = %report.summary(), "Migration step committed");
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback) = self.session.connection().rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                // The rollback also undid any SET issued inside the transaction.
                if let Err(restore) = self.session.switch(previous).await {
                    warn!(error = %restore, "Failed to restore active schema after rollback");
                }
                self.deferred.clear();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<C, S> MigrationExecutor for SchemaEditor<'_, C, S>
where
    C: SchemaConnection,
    S: SchemaStore,
{
    async fn execute(&mut self, sql: &str) -> TenancyResult<Routing> {
        SchemaEditor::execute(self, sql).await
    }

    fn defer(&mut self, sql: &str) -> bool {
        SchemaEditor::defer(self, sql)
    }

    async fn flush(&mut self) -> TenancyResult<usize> {
        SchemaEditor::flush(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenancyConfig;
    use crate::connection::ConnectionSource;
    use crate::memory::{MemoryConnection, MemoryDatabase};
    use crate::schema::NewSchema;
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: MemoryDatabase,
        registry: SchemaRegistry<MemoryDatabase>,
        tables: TableRegistry,
        session: SchemaSession<MemoryConnection>,
    }

    async fn fixture(tenants: &[&str]) -> Fixture {
        let db = MemoryDatabase::new();
        db.execute_in(TEMPLATE_SCHEMA, "CREATE TABLE widgets (id int, name text)")
            .unwrap();
        db.execute_in("public", "CREATE TABLE plans (id int, name text)")
            .unwrap();
        let registry = SchemaRegistry::new(db.clone());
        registry.bulk_create(tenants.iter().copied()).await.unwrap();

        let config = TenancyConfig::default().with_shared_table("plans");
        let tables = TableRegistry::from_config(&config).unwrap();
        let session = SchemaSession::new(db.acquire().await.unwrap(), &config);
        Fixture {
            db,
            registry,
            tables,
            session,
        }
    }

    fn tables() -> TableRegistry {
        TableRegistry::new().shared("plans").unwrap()
    }

    fn target(table: Option<&str>, schema: Option<&str>) -> StatementTarget {
        StatementTarget {
            table: table.map(str::to_string),
            schema: schema.map(str::to_string),
        }
    }

    #[test]
    fn test_decide() {
        let tables = tables();
        assert_eq!(decide(&target(None, None), &tables), Routing::Once);
        assert_eq!(decide(&target(Some("plans"), None), &tables), Routing::Once);
        assert_eq!(decide(&target(Some("widgets"), Some("acme")), &tables), Routing::Once);
        assert_eq!(decide(&target(None, Some("acme")), &tables), Routing::Once);
        assert_eq!(
            decide(&target(Some("widgets"), None), &tables),
            Routing::FanOut {
                table: "widgets".into()
            }
        );
        // A quoted "Plans" is a different table from the shared plans.
        assert_eq!(
            decide(&target(Some("Plans"), None), &tables),
            Routing::FanOut {
                table: "Plans".into()
            }
        );
    }

    #[tokio::test]
    async fn test_alter_fans_out_in_creation_order() {
        let mut f = fixture(&["b", "a"]).await;
        f.db.clear_statements();

        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        let routing = editor.execute("ALTER TABLE widgets ADD COLUMN colour text").await.unwrap();
        assert!(routing.is_fan_out());

        let paths: Vec<String> = f
            .db
            .statements()
            .into_iter()
            .filter(|s| s.sql.starts_with("ALTER"))
            .map(|s| s.search_path[0].clone())
            .collect();
        assert_eq!(paths, vec![TEMPLATE_SCHEMA, "b", "a"]);

        for schema in [TEMPLATE_SCHEMA, "a", "b"] {
            let table = f.db.table(schema, "widgets").unwrap();
            assert!(table.columns.contains(&"colour".to_string()), "{schema}");
        }
    }

    #[tokio::test]
    async fn test_context_restored_after_fan_out() {
        let mut f = fixture(&["a", "b"]).await;
        f.session.activate("b").await.unwrap();

        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        editor.execute("CREATE INDEX widgets_name ON widgets (name)").await.unwrap();
        assert_eq!(editor.session().current().tenant().unwrap(), "b");

        let mut f = fixture(&["a"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        editor.execute("ALTER TABLE widgets ADD x int").await.unwrap();
        assert!(editor.session().current().is_none());
        assert_eq!(f.session.connection().search_path(), vec!["public".to_string()]);
    }

    #[tokio::test]
    async fn test_shared_and_qualified_run_once() {
        let mut f = fixture(&["a", "b"]).await;
        f.db.clear_statements();
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);

        assert_eq!(
            editor.execute("ALTER TABLE plans ADD COLUMN price int").await.unwrap(),
            Routing::Once
        );
        assert_eq!(
            editor.execute("ALTER TABLE a.widgets ADD COLUMN only_a int").await.unwrap(),
            Routing::Once
        );
        assert_eq!(
            editor
                .execute("CREATE FUNCTION f() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql")
                .await
                .unwrap(),
            Routing::Once
        );

        assert!(f.db.table("a", "widgets").unwrap().columns.contains(&"only_a".to_string()));
        assert!(!f.db.table("b", "widgets").unwrap().columns.contains(&"only_a".to_string()));
        assert!(f.db.table("public", "plans").unwrap().columns.contains(&"price".to_string()));
        assert_eq!(f.db.statements().len(), 3);
    }

    #[tokio::test]
    async fn test_insert_seed_data_fans_out() {
        let mut f = fixture(&["a", "b"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        editor
            .execute("INSERT INTO widgets (id, name) VALUES (1, 'default')")
            .await
            .unwrap();

        for schema in [TEMPLATE_SCHEMA, "a", "b"] {
            assert_eq!(
                f.db.rows(schema, "widgets"),
                vec![vec!["1".to_string(), "default".to_string()]]
            );
        }
    }

    #[tokio::test]
    async fn test_drop_index_resolves_owner() {
        let mut f = fixture(&["a"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        editor.execute("CREATE INDEX widgets_name ON widgets (name)").await.unwrap();

        assert_eq!(
            editor.route("DROP INDEX widgets_name").await.unwrap(),
            Routing::FanOut {
                table: "widgets".into()
            }
        );
        editor.execute("DROP INDEX widgets_name").await.unwrap();
        assert!(f.db.table("a", "widgets").unwrap().indexes.is_empty());
        assert!(f.db.table(TEMPLATE_SCHEMA, "widgets").unwrap().indexes.is_empty());
    }

    #[tokio::test]
    async fn test_failure_propagates_and_restores() {
        let mut f = fixture(&["a", "b"]).await;
        f.db.execute_in("a", "ALTER TABLE widgets ADD COLUMN colour text").unwrap();
        f.session.activate("b").await.unwrap();

        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        let err = editor
            .execute("ALTER TABLE widgets ADD COLUMN colour text")
            .await
            .unwrap_err();
        assert_eq!(err.context.schema.as_deref(), Some("a"));
        assert_eq!(err.context.sql.as_deref(), Some("ALTER TABLE widgets ADD COLUMN colour text"));
        assert_eq!(editor.session().current().tenant().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_deferred_statements_deduplicated() {
        let mut f = fixture(&["a"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);

        assert!(editor.defer("CREATE INDEX w_id ON widgets (id)"));
        assert!(editor.defer("CREATE INDEX w_name ON widgets (name)"));
        assert!(!editor.defer("CREATE INDEX w_id ON widgets (id)"));
        assert_eq!(
            editor.deferred().collect::<Vec<_>>(),
            vec!["CREATE INDEX w_id ON widgets (id)", "CREATE INDEX w_name ON widgets (name)"]
        );

        assert_eq!(editor.flush().await.unwrap(), 2);
        assert_eq!(editor.deferred().count(), 0);
        let indexes = &f.db.table("a", "widgets").unwrap().indexes;
        assert_eq!(indexes.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_atomic_commits() {
        let mut f = fixture(&["a"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        editor.defer("CREATE INDEX w_colour ON widgets (colour)");

        let report = editor
            .apply_atomic(
                "ALTER TABLE widgets ADD COLUMN colour text;\n\
                 ALTER TABLE plans ADD COLUMN tier text;",
            )
            .await
            .unwrap();
        assert_eq!(report.fanned_out, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(report.deferred, 1);
        assert!(f.db.table("a", "widgets").unwrap().indexes.contains("w_colour"));
    }

    #[tokio::test]
    async fn test_apply_atomic_rolls_back() {
        let mut f = fixture(&["a", "b"]).await;
        f.db.execute_in("b", "ALTER TABLE widgets ADD COLUMN colour text").unwrap();

        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        let err = editor
            .apply_atomic("ALTER TABLE widgets ADD COLUMN colour text;")
            .await
            .unwrap_err();
        assert_eq!(err.context.schema.as_deref(), Some("b"));
        assert!(editor.session().current().is_none());

        for schema in [TEMPLATE_SCHEMA, "a"] {
            let columns = f.db.table(schema, "widgets").unwrap().columns;
            assert!(!columns.contains(&"colour".to_string()));
        }
        assert_eq!(f.session.connection().search_path(), vec!["public".to_string()]);
    }

    async fn run_migration<M: MigrationExecutor>(executor: &mut M) -> TenancyResult<()> {
        executor.execute("CREATE TABLE gadgets (id int)").await?;
        executor.defer("CREATE INDEX gadgets_id ON gadgets (id)");
        executor.defer("CREATE INDEX gadgets_id ON gadgets (id)");
        executor.flush().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_executor_trait() {
        let mut f = fixture(&["a"]).await;
        let mut editor = SchemaEditor::new(&mut f.session, &f.registry, &f.tables);
        run_migration(&mut editor).await.unwrap();

        assert_eq!(f.db.tables("a"), vec!["gadgets".to_string(), "widgets".to_string()]);
        assert_eq!(f.db.table(TEMPLATE_SCHEMA, "gadgets").unwrap().indexes.len(), 1);

        registry_created_later_has_table(&f).await;
    }

    async fn registry_created_later_has_table(f: &Fixture) {
        f.registry.create(NewSchema::new("later")).await.unwrap();
        assert!(f.db.tables("later").contains(&"gadgets".to_string()));
    }

    #[test]
    fn test_report_summary() {
        assert_eq!(ScriptReport::default().summary(), "No statements applied");
        let report = ScriptReport {
            executed: 1,
            fanned_out: 2,
            deferred: 0,
            duration_ms: 5,
        };
        assert_eq!(report.summary(), "1 executed once, 2 fanned out in 5ms");
    }
}

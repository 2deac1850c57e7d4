//! In-memory backend.
//!
//! [`MemoryDatabase`] models schemas, tables, columns, indexes and rows in
//! process and understands the statement shapes the classifier routes:
//!
//! - `CREATE/DROP SCHEMA`
//! - `CREATE/DROP TABLE`, `CREATE/DROP VIEW`
//! - `CREATE/DROP/ALTER INDEX`
//! - `ALTER TABLE ... ADD/DROP/RENAME`
//! - `INSERT ... VALUES`, `UPDATE ... SET`, `DELETE`, with `col = value`
//!   conditions joined by `AND`
//! - `SELECT ... FROM t`, which only checks that `t` resolves
//! - `SET search_path`, `BEGIN`, `COMMIT`, `ROLLBACK`
//!
//! Other statements are logged and otherwise ignored. Unqualified names
//! resolve through the connection's search path, so a missing tenant table
//! fails with an undefined relation error exactly as PostgreSQL would.
//!
//! Transactions snapshot the whole database. A rollback also discards
//! changes other connections made in the meantime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::classify::{Cursor, ObjectName, Token, split_statements, tokenize};
use crate::connection::{Catalog, ConnectionSource, SchemaConnection};
use crate::error::{TenancyError, TenancyResult};
use crate::identifier::{SchemaName, SchemaRef, TEMPLATE_SCHEMA};
use crate::registry::SchemaStore;
use crate::schema::{Schema, UserId};
use crate::tables::{DISPLAY_NAME_CONSTRAINT, SCHEMA_TABLE};

const PUBLIC_SCHEMA: &str = "public";

fn unique_violation(constraint: &str) -> TenancyError {
    TenancyError::unique_violation(format!(
        "duplicate key value violates unique constraint \"{}\"",
        constraint
    ))
    .with_constraint(constraint)
}

/// A table or view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Index names.
    pub indexes: BTreeSet<String>,
    /// Rows, values rendered as written.
    pub rows: Vec<Vec<String>>,
    /// Check if this is a view.
    pub is_view: bool,
}

/// A statement as it reached the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    /// Search path in effect.
    pub search_path: Vec<String>,
    /// Statement text.
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
struct Data {
    namespaces: BTreeMap<String, BTreeMap<String, Table>>,
    registry: Vec<Schema>,
}

#[derive(Debug, Default)]
struct State {
    data: Data,
    log: Vec<ExecutedStatement>,
}

/// Shared in-process database. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// A database with the public schema and an empty template.
    pub fn new() -> Self {
        let mut data = Data::default();
        data.namespaces.insert(PUBLIC_SCHEMA.to_string(), BTreeMap::new());
        data.namespaces.insert(TEMPLATE_SCHEMA.to_string(), BTreeMap::new());
        Self {
            state: Arc::new(Mutex::new(State {
                data,
                log: Vec::new(),
            })),
        }
    }

    /// Run statements with only `schema` on the search path.
    pub fn execute_in(&self, schema: &str, sql: &str) -> TenancyResult<()> {
        let path = vec![schema.to_string()];
        for statement in split_statements(sql) {
            self.apply(&path, &statement)?;
        }
        Ok(())
    }

    /// All physical schemas, sorted.
    pub fn schemas(&self) -> Vec<String> {
        self.state.lock().data.namespaces.keys().cloned().collect()
    }

    /// Table and view names in a schema, sorted.
    pub fn tables(&self, schema: &str) -> Vec<String> {
        self.state
            .lock()
            .data
            .namespaces
            .get(schema)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// A table, if it exists.
    pub fn table(&self, schema: &str, table: &str) -> Option<Table> {
        self.state
            .lock()
            .data
            .namespaces
            .get(schema)
            .and_then(|tables| tables.get(table))
            .cloned()
    }

    /// Rows of a table; empty if it does not exist.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Vec<String>> {
        self.table(schema, table).map(|t| t.rows).unwrap_or_default()
    }

    /// Every statement executed so far.
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.state.lock().log.clone()
    }

    /// Forget the statement log.
    pub fn clear_statements(&self) {
        self.state.lock().log.clear();
    }

    fn log(&self, search_path: &[String], sql: &str) {
        trace!(sql = %sql, "memory backend statement");
        self.state.lock().log.push(ExecutedStatement {
            search_path: search_path.to_vec(),
            sql: sql.to_string(),
        });
    }

    fn apply(&self, path: &[String], sql: &str) -> TenancyResult<()> {
        self.log(path, sql);
        let mut state = self.state.lock();
        state.data.apply(path, sql)
    }

    fn snapshot(&self) -> Data {
        self.state.lock().data.clone()
    }

    fn restore(&self, data: Data) {
        self.state.lock().data = data;
    }
}

#[async_trait]
impl SchemaStore for MemoryDatabase {
    async fn create(&self, schema: &Schema, source: &SchemaRef) -> TenancyResult<()> {
        self.log(
            &[],
            &format!("SELECT clone_schema('{}', '{}')", source, schema.name),
        );
        let mut state = self.state.lock();
        let data = &mut state.data;

        if data.registry.iter().any(|s| s.name == schema.name) {
            return Err(unique_violation(&format!("{}_pkey", SCHEMA_TABLE)));
        }
        if data
            .registry
            .iter()
            .any(|s| s.display_name == schema.display_name)
        {
            return Err(unique_violation(DISPLAY_NAME_CONSTRAINT));
        }
        if data.namespaces.contains_key(schema.name.as_str()) {
            return Err(TenancyError::database(format!(
                "schema \"{}\" already exists",
                schema.name
            )));
        }
        let tables = data
            .namespaces
            .get(source.as_str())
            .cloned()
            .ok_or_else(|| {
                TenancyError::database(format!("schema \"{}\" does not exist", source))
            })?;

        data.namespaces.insert(schema.name.to_string(), tables);
        data.registry.push(Schema::restore(
            schema.name.clone(),
            schema.display_name.clone(),
            schema.is_active,
            schema.users.iter().copied(),
            schema.created_at,
        ));
        Ok(())
    }

    async fn update(&self, schema: &Schema) -> TenancyResult<()> {
        let mut state = self.state.lock();
        let registry = &mut state.data.registry;

        if registry
            .iter()
            .any(|s| s.name != schema.name && s.display_name == schema.display_name)
        {
            return Err(unique_violation(DISPLAY_NAME_CONSTRAINT));
        }
        let row = registry
            .iter_mut()
            .find(|s| s.name == schema.name)
            .ok_or_else(|| TenancyError::not_found(schema.name.as_str()))?;
        row.display_name = schema.display_name.clone();
        row.is_active = schema.is_active;
        row.users = schema.users.clone();
        Ok(())
    }

    async fn delete(&self, name: &SchemaName) -> TenancyResult<()> {
        self.log(&[], &format!("DROP SCHEMA \"{}\" CASCADE", name));
        let mut state = self.state.lock();
        let data = &mut state.data;
        let before = data.registry.len();
        data.registry.retain(|s| s.name != *name);
        if data.registry.len() == before {
            return Err(TenancyError::not_found(name.as_str()));
        }
        data.namespaces.remove(name.as_str());
        Ok(())
    }

    async fn get(&self, name: &str) -> TenancyResult<Option<Schema>> {
        let state = self.state.lock();
        Ok(state.data.registry.iter().find(|s| s.name == name).cloned())
    }

    async fn find_by_display_name(&self, display_name: &str) -> TenancyResult<Option<Schema>> {
        let state = self.state.lock();
        Ok(state
            .data
            .registry
            .iter()
            .find(|s| s.display_name == display_name)
            .cloned())
    }

    async fn list(&self) -> TenancyResult<Vec<Schema>> {
        Ok(self.state.lock().data.registry.clone())
    }

    async fn list_for_user(&self, user: UserId) -> TenancyResult<Vec<Schema>> {
        let state = self.state.lock();
        Ok(state
            .data
            .registry
            .iter()
            .filter(|s| s.users.contains(&user))
            .cloned()
            .collect())
    }

    async fn schema_exists(&self, name: &str) -> TenancyResult<bool> {
        Ok(self.state.lock().data.namespaces.contains_key(name))
    }
}

#[async_trait]
impl ConnectionSource for MemoryDatabase {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> TenancyResult<MemoryConnection> {
        Ok(MemoryConnection::new(self.clone()))
    }
}

#[derive(Debug)]
struct Transaction {
    snapshot: Data,
    search_path: Vec<String>,
    failed: bool,
}

/// A connection to a [`MemoryDatabase`] with its own search path.
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    search_path: Mutex<Vec<String>>,
    transaction: Mutex<Option<Transaction>>,
}

impl MemoryConnection {
    fn new(db: MemoryDatabase) -> Self {
        Self {
            db,
            search_path: Mutex::new(vec![PUBLIC_SCHEMA.to_string()]),
            transaction: Mutex::new(None),
        }
    }

    /// The database this connection talks to.
    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Current search path.
    pub fn search_path(&self) -> Vec<String> {
        self.search_path.lock().clone()
    }

    /// Rows of a table resolved through the search path, like a `SELECT *`.
    pub fn rows(&self, table: &str) -> TenancyResult<Vec<Vec<String>>> {
        let path = self.search_path();
        let state = self.db.state.lock();
        let (schema, table) = state.data.resolve(&path, &ObjectName::bare(table))?;
        Ok(state.data.namespaces[&schema][&table].rows.clone())
    }

    fn execute_one(&self, sql: &str) -> TenancyResult<()> {
        let path = self.search_path();
        let tokens: Vec<Token> = tokenize(sql).into_iter().map(|s| s.token).collect();
        let mut cursor = Cursor::new(&tokens);
        let mut transaction = self.transaction.lock();

        if cursor.eat("BEGIN") || cursor.eat_sequence(&["START", "TRANSACTION"]) {
            self.db.log(&path, sql);
            if transaction.is_none() {
                *transaction = Some(Transaction {
                    snapshot: self.db.snapshot(),
                    search_path: path,
                    failed: false,
                });
            }
            return Ok(());
        }

        if cursor.eat("COMMIT") || cursor.eat("END") {
            self.db.log(&path, sql);
            // Committing a failed transaction rolls it back.
            if let Some(txn) = transaction.take().filter(|txn| txn.failed) {
                self.rollback_to(txn);
            }
            return Ok(());
        }

        if cursor.eat("ROLLBACK") || cursor.eat("ABORT") {
            self.db.log(&path, sql);
            if let Some(txn) = transaction.take() {
                self.rollback_to(txn);
            }
            return Ok(());
        }

        if transaction.as_ref().is_some_and(|txn| txn.failed) {
            self.db.log(&path, sql);
            return Err(TenancyError::database(
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        let result = if cursor.eat("SET") && cursor.eat("SEARCH_PATH") {
            self.db.log(&path, sql);
            self.set_search_path_from(&mut cursor)
        } else {
            self.db.apply(&path, sql)
        };

        if result.is_err() {
            if let Some(txn) = transaction.as_mut() {
                txn.failed = true;
            }
        }
        result
    }

    fn rollback_to(&self, txn: Transaction) {
        self.db.restore(txn.snapshot);
        *self.search_path.lock() = txn.search_path;
    }

    fn set_search_path_from(&self, cursor: &mut Cursor<'_>) -> TenancyResult<()> {
        if !cursor.eat("TO") && !cursor.eat_token(&Token::Other('=')) {
            return Err(TenancyError::database("syntax error in SET search_path"));
        }
        let mut schemas = Vec::new();
        loop {
            match cursor.advance() {
                Some(token) if token.is_keyword("DEFAULT") => {
                    schemas.push(PUBLIC_SCHEMA.to_string())
                }
                Some(Token::Literal(value)) => schemas.push(value.clone()),
                Some(token) => match token.identifier() {
                    Some(ident) => schemas.push(ident),
                    None => return Err(TenancyError::database("syntax error in SET search_path")),
                },
                None => break,
            }
            if !cursor.eat_token(&Token::Comma) {
                break;
            }
        }
        *self.search_path.lock() = schemas;
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryConnection {
    async fn index_owner(&self, index: &str, schemas: &[&str]) -> TenancyResult<Option<String>> {
        let state = self.db.state.lock();
        Ok(schemas.iter().find_map(|schema| {
            state.data.namespaces.get(*schema).and_then(|tables| {
                tables
                    .iter()
                    .find(|(_, table)| table.indexes.contains(index))
                    .map(|(name, _)| name.clone())
            })
        }))
    }
}

#[async_trait]
impl SchemaConnection for MemoryConnection {
    async fn batch_execute(&self, sql: &str) -> TenancyResult<()> {
        for statement in split_statements(sql) {
            self.execute_one(&statement)?;
        }
        Ok(())
    }
}

const CONSTRAINT_WORDS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "UNIQUE",
    "FOREIGN",
    "CHECK",
    "EXCLUDE",
    "LIKE",
];

impl Data {
    fn apply(&mut self, path: &[String], sql: &str) -> TenancyResult<()> {
        let tokens: Vec<Token> = tokenize(sql).into_iter().map(|s| s.token).collect();
        let mut c = Cursor::new(&tokens);

        if c.eat("CREATE") {
            c.eat_sequence(&["OR", "REPLACE"]);
            if c.eat("SCHEMA") {
                return self.create_schema(&mut c);
            }
            while c.eat_any(&[
                "TEMP",
                "TEMPORARY",
                "UNLOGGED",
                "GLOBAL",
                "LOCAL",
                "MATERIALIZED",
            ]) {}
            c.eat("UNIQUE");
            if c.eat("TABLE") {
                return self.create_table(path, &mut c);
            }
            if c.eat("VIEW") {
                return self.create_view(path, &mut c);
            }
            if c.eat("INDEX") {
                return self.create_index(path, &mut c);
            }
            Ok(())
        } else if c.eat("DROP") {
            if c.eat("SCHEMA") {
                return self.drop_schema(&mut c);
            }
            c.eat_any(&["MATERIALIZED", "FOREIGN"]);
            if c.eat("TABLE") || c.eat("VIEW") {
                return self.drop_tables(path, &mut c);
            }
            if c.eat("INDEX") {
                return self.drop_index(path, &mut c);
            }
            Ok(())
        } else if c.eat("ALTER") {
            if c.eat("TABLE") {
                return self.alter_table(path, &mut c);
            }
            if c.eat("INDEX") {
                return self.alter_index(path, &mut c);
            }
            Ok(())
        } else if c.eat("INSERT") {
            c.eat("INTO");
            self.insert(path, &mut c)
        } else if c.eat("UPDATE") {
            c.eat("ONLY");
            self.update(path, &mut c)
        } else if c.eat("DELETE") {
            c.eat("FROM");
            c.eat("ONLY");
            self.delete(path, &mut c)
        } else if c.eat("SELECT") {
            if c.skip_to("FROM").is_some() {
                if let Some(name) = c.object_name() {
                    self.resolve(path, &name)?;
                }
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    fn create_schema(&mut self, c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_not_exists = c.eat_sequence(&["IF", "NOT", "EXISTS"]);
        let name = c.identifier().ok_or_else(syntax_error)?;
        if self.namespaces.contains_key(&name) {
            if if_not_exists {
                return Ok(());
            }
            return Err(TenancyError::database(format!("schema \"{}\" already exists", name)));
        }
        self.namespaces.insert(name, BTreeMap::new());
        Ok(())
    }

    fn drop_schema(&mut self, c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
        let name = c.identifier().ok_or_else(syntax_error)?;
        if self.namespaces.remove(&name).is_none() && !if_exists {
            return Err(TenancyError::database(format!("schema \"{}\" does not exist", name)));
        }
        Ok(())
    }

    fn create_table(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_not_exists = c.eat_sequence(&["IF", "NOT", "EXISTS"]);
        let name = c.object_name().ok_or_else(syntax_error)?;
        let columns = column_list(c);
        self.insert_relation(
            path,
            &name,
            Table {
                columns,
                ..Table::default()
            },
            if_not_exists,
        )
    }

    fn create_view(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let name = c.object_name().ok_or_else(syntax_error)?;
        let columns = column_list(c);
        self.insert_relation(
            path,
            &name,
            Table {
                columns,
                is_view: true,
                ..Table::default()
            },
            true,
        )
    }

    fn insert_relation(
        &mut self,
        path: &[String],
        name: &ObjectName,
        table: Table,
        replace_ok: bool,
    ) -> TenancyResult<()> {
        let schema = self.creation_schema(path, name)?;
        let tables = self.namespace_mut(&schema)?;
        if tables.contains_key(&name.name) {
            if replace_ok {
                return Ok(());
            }
            return Err(TenancyError::database(format!(
                "relation \"{}\" already exists",
                name.name
            )));
        }
        tables.insert(name.name.clone(), table);
        Ok(())
    }

    fn create_index(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        c.eat("CONCURRENTLY");
        let if_not_exists = c.eat_sequence(&["IF", "NOT", "EXISTS"]);
        let index = if c.peek_is("ON") { None } else { c.identifier() };
        c.expect("ON").ok_or_else(syntax_error)?;
        c.eat("ONLY");
        let name = c.object_name().ok_or_else(syntax_error)?;
        let (schema, table_name) = self.resolve(path, &name)?;

        let index = index.unwrap_or_else(|| format!("{}_idx", table_name));
        let tables = self.namespace_mut(&schema)?;
        if tables.values().any(|t| t.indexes.contains(&index)) {
            if if_not_exists {
                return Ok(());
            }
            return Err(TenancyError::database(format!("relation \"{}\" already exists", index)));
        }
        if let Some(table) = tables.get_mut(&table_name) {
            table.indexes.insert(index);
        }
        Ok(())
    }

    fn drop_tables(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
        loop {
            let name = c.object_name().ok_or_else(syntax_error)?;
            match self.resolve(path, &name) {
                Ok((schema, table)) => {
                    self.namespace_mut(&schema)?.remove(&table);
                }
                Err(e) if !(if_exists && e.is_undefined_relation()) => return Err(e),
                Err(_) => {}
            }
            if !c.eat_token(&Token::Comma) {
                return Ok(());
            }
        }
    }

    fn drop_index(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        c.eat("CONCURRENTLY");
        let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
        let name = c.object_name().ok_or_else(syntax_error)?;
        match self.find_index(path, &name) {
            Some((schema, table)) => {
                if let Some(table) = self.namespace_mut(&schema)?.get_mut(&table) {
                    table.indexes.remove(&name.name);
                }
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(TenancyError::undefined_relation(&name.name)),
        }
    }

    fn alter_index(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
        let name = c.object_name().ok_or_else(syntax_error)?;
        let Some((schema, table)) = self.find_index(path, &name) else {
            if if_exists {
                return Ok(());
            }
            return Err(TenancyError::undefined_relation(&name.name));
        };
        if c.eat_sequence(&["RENAME", "TO"]) {
            let renamed = c.identifier().ok_or_else(syntax_error)?;
            if let Some(table) = self.namespace_mut(&schema)?.get_mut(&table) {
                table.indexes.remove(&name.name);
                table.indexes.insert(renamed);
            }
        }
        Ok(())
    }

    fn alter_table(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
        c.eat("ONLY");
        let name = c.object_name().ok_or_else(syntax_error)?;
        let (schema, table_name) = match self.resolve(path, &name) {
            Ok(found) => found,
            Err(e) if if_exists && e.is_undefined_relation() => return Ok(()),
            Err(e) => return Err(e),
        };

        if c.eat_sequence(&["RENAME", "TO"]) {
            let renamed = c.identifier().ok_or_else(syntax_error)?;
            let tables = self.namespace_mut(&schema)?;
            if tables.contains_key(&renamed) {
                return Err(TenancyError::database(format!(
                    "relation \"{}\" already exists",
                    renamed
                )));
            }
            if let Some(table) = tables.remove(&table_name) {
                tables.insert(renamed, table);
            }
            return Ok(());
        }

        let table = self
            .namespace_mut(&schema)?
            .get_mut(&table_name)
            .ok_or_else(|| TenancyError::undefined_relation(&table_name))?;

        if c.eat("ADD") {
            if CONSTRAINT_WORDS.iter().any(|k| c.peek_is(k)) {
                return Ok(());
            }
            c.eat("COLUMN");
            let if_not_exists = c.eat_sequence(&["IF", "NOT", "EXISTS"]);
            let column = c.identifier().ok_or_else(syntax_error)?;
            if table.columns.contains(&column) {
                if if_not_exists {
                    return Ok(());
                }
                return Err(TenancyError::database(format!(
                    "column \"{}\" of relation \"{}\" already exists",
                    column, table_name
                )));
            }
            table.columns.push(column);
            for row in &mut table.rows {
                row.push("NULL".to_string());
            }
        } else if c.eat("DROP") {
            if c.peek_is("CONSTRAINT") {
                return Ok(());
            }
            c.eat("COLUMN");
            let if_exists = c.eat_sequence(&["IF", "EXISTS"]);
            let column = c.identifier().ok_or_else(syntax_error)?;
            match table.columns.iter().position(|col| *col == column) {
                Some(idx) => {
                    table.columns.remove(idx);
                    for row in &mut table.rows {
                        if idx < row.len() {
                            row.remove(idx);
                        }
                    }
                }
                None if if_exists => {}
                None => return Err(missing_column(&column, &table_name)),
            }
        } else if c.eat("RENAME") {
            if c.peek_is("CONSTRAINT") {
                return Ok(());
            }
            c.eat("COLUMN");
            let from = c.identifier().ok_or_else(syntax_error)?;
            c.expect("TO").ok_or_else(syntax_error)?;
            let to = c.identifier().ok_or_else(syntax_error)?;
            let col = table
                .columns
                .iter_mut()
                .find(|col| **col == from)
                .ok_or_else(|| missing_column(&from, &table_name))?;
            *col = to;
        }
        Ok(())
    }

    fn insert(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let name = c.object_name().ok_or_else(syntax_error)?;
        let (schema, table_name) = self.resolve(path, &name)?;
        let targets = column_list(c);
        if !c.eat("VALUES") {
            return Ok(());
        }
        let rows = value_rows(c);

        let table = self
            .namespace_mut(&schema)?
            .get_mut(&table_name)
            .ok_or_else(|| TenancyError::undefined_relation(&table_name))?;
        let positions = if targets.is_empty() {
            (0..table.columns.len()).collect::<Vec<_>>()
        } else {
            targets
                .iter()
                .map(|target| {
                    table
                        .columns
                        .iter()
                        .position(|col| col == target)
                        .ok_or_else(|| missing_column(target, &table_name))
                })
                .collect::<TenancyResult<Vec<_>>>()?
        };

        for values in rows {
            if values.len() > positions.len() {
                return Err(TenancyError::database(
                    "INSERT has more expressions than target columns",
                ));
            }
            let mut row = vec!["NULL".to_string(); table.columns.len()];
            for (value, &pos) in values.into_iter().zip(&positions) {
                row[pos] = value;
            }
            table.rows.push(row);
        }
        Ok(())
    }

    fn update(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let name = c.object_name().ok_or_else(syntax_error)?;
        let (schema, table_name) = self.resolve(path, &name)?;
        let table = self
            .namespace_mut(&schema)?
            .get_mut(&table_name)
            .ok_or_else(|| TenancyError::undefined_relation(&table_name))?;

        c.expect("SET").ok_or_else(syntax_error)?;
        let mut assignments = Vec::new();
        loop {
            let column = c.identifier().ok_or_else(syntax_error)?;
            if !c.eat_token(&Token::Other('=')) {
                return Err(syntax_error());
            }
            let value = c.advance().map(render).ok_or_else(syntax_error)?;
            let idx = column_index(table, &column, &table_name)?;
            assignments.push((idx, value));
            if !c.eat_token(&Token::Comma) {
                break;
            }
        }
        let conditions = where_clause(c, table, &table_name)?;

        for row in table.rows.iter_mut().filter(|row| matches(row, &conditions)) {
            for (idx, value) in &assignments {
                row[*idx] = value.clone();
            }
        }
        Ok(())
    }

    fn delete(&mut self, path: &[String], c: &mut Cursor<'_>) -> TenancyResult<()> {
        let name = c.object_name().ok_or_else(syntax_error)?;
        let (schema, table_name) = self.resolve(path, &name)?;
        let table = self
            .namespace_mut(&schema)?
            .get_mut(&table_name)
            .ok_or_else(|| TenancyError::undefined_relation(&table_name))?;
        let conditions = where_clause(c, table, &table_name)?;
        table.rows.retain(|row| !matches(row, &conditions));
        Ok(())
    }

    /// Find the schema holding a relation, following the search path for
    /// unqualified names.
    fn resolve(&self, path: &[String], name: &ObjectName) -> TenancyResult<(String, String)> {
        match &name.schema {
            Some(schema) => {
                let tables = self.namespaces.get(schema).ok_or_else(|| {
                    TenancyError::database(format!("schema \"{}\" does not exist", schema))
                })?;
                if tables.contains_key(&name.name) {
                    Ok((schema.clone(), name.name.clone()))
                } else {
                    Err(TenancyError::undefined_relation(format!(
                        "{}.{}",
                        schema, name.name
                    )))
                }
            }
            None => path
                .iter()
                .find(|schema| {
                    self.namespaces
                        .get(*schema)
                        .is_some_and(|tables| tables.contains_key(&name.name))
                })
                .map(|schema| (schema.clone(), name.name.clone()))
                .ok_or_else(|| TenancyError::undefined_relation(&name.name)),
        }
    }

    fn creation_schema(&self, path: &[String], name: &ObjectName) -> TenancyResult<String> {
        match &name.schema {
            Some(schema) if self.namespaces.contains_key(schema) => Ok(schema.clone()),
            Some(schema) => Err(TenancyError::database(format!(
                "schema \"{}\" does not exist",
                schema
            ))),
            None => path
                .iter()
                .find(|schema| self.namespaces.contains_key(*schema))
                .cloned()
                .ok_or_else(|| TenancyError::database("no schema has been selected to create in")),
        }
    }

    fn find_index(&self, path: &[String], name: &ObjectName) -> Option<(String, String)> {
        let schemas: Vec<&String> = match &name.schema {
            Some(schema) => vec![schema],
            None => path.iter().collect(),
        };
        schemas.into_iter().find_map(|schema| {
            self.namespaces.get(schema).and_then(|tables| {
                tables
                    .iter()
                    .find(|(_, table)| table.indexes.contains(&name.name))
                    .map(|(table, _)| (schema.clone(), table.clone()))
            })
        })
    }

    fn namespace_mut(&mut self, schema: &str) -> TenancyResult<&mut BTreeMap<String, Table>> {
        self.namespaces.get_mut(schema).ok_or_else(|| {
            TenancyError::database(format!("schema \"{}\" does not exist", schema))
        })
    }
}

fn syntax_error() -> TenancyError {
    TenancyError::database("syntax error")
}

fn missing_column(column: &str, table: &str) -> TenancyError {
    TenancyError::database(format!(
        "column \"{}\" of relation \"{}\" does not exist",
        column, table
    ))
}

fn column_index(table: &Table, column: &str, table_name: &str) -> TenancyResult<usize> {
    table
        .columns
        .iter()
        .position(|col| col == column)
        .ok_or_else(|| missing_column(column, table_name))
}

/// Read a parenthesized list of column definitions or names, keeping the
/// leading identifier of each item that is not a table constraint.
fn column_list(c: &mut Cursor<'_>) -> Vec<String> {
    let mut columns = Vec::new();
    if !c.eat_token(&Token::LParen) {
        return columns;
    }
    let mut depth = 1usize;
    let mut item_start = true;
    while let Some(token) = c.advance() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Token::Comma if depth == 1 => {
                item_start = true;
                continue;
            }
            token if item_start && depth == 1 => {
                if !CONSTRAINT_WORDS.iter().any(|k| token.is_keyword(k)) {
                    if let Some(column) = token.identifier() {
                        columns.push(column);
                    }
                }
            }
            _ => {}
        }
        item_start = false;
    }
    columns
}

/// Read `(v, ...), (v, ...)` rows.
fn value_rows(c: &mut Cursor<'_>) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    while c.eat_token(&Token::LParen) {
        let mut row = Vec::new();
        let mut current = String::new();
        let mut depth = 1usize;
        while let Some(token) = c.advance() {
            match token {
                Token::LParen => {
                    depth += 1;
                    current.push('(');
                }
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        row.push(std::mem::take(&mut current));
                        break;
                    }
                    current.push(')');
                }
                Token::Comma if depth == 1 => row.push(std::mem::take(&mut current)),
                token => current.push_str(&render(token)),
            }
        }
        rows.push(row);
        if !c.eat_token(&Token::Comma) {
            break;
        }
    }
    rows
}

fn render(token: &Token) -> String {
    match token {
        Token::Word(w) if w.eq_ignore_ascii_case("null") => "NULL".to_string(),
        Token::Word(w) | Token::Quoted(w) | Token::Literal(w) => w.clone(),
        Token::Dot => ".".to_string(),
        Token::Comma => ",".to_string(),
        Token::LParen => "(".to_string(),
        Token::RParen => ")".to_string(),
        Token::Semicolon => ";".to_string(),
        Token::Other(ch) => ch.to_string(),
    }
}

/// Read `WHERE col = value [AND col = value ...]`; no clause matches every row.
fn where_clause(
    c: &mut Cursor<'_>,
    table: &Table,
    table_name: &str,
) -> TenancyResult<Vec<(usize, String)>> {
    let mut conditions = Vec::new();
    if !c.eat("WHERE") {
        return Ok(conditions);
    }
    loop {
        let column = c.identifier().ok_or_else(unsupported_where)?;
        if !c.eat_token(&Token::Other('=')) {
            return Err(unsupported_where());
        }
        let value = c.advance().map(render).ok_or_else(unsupported_where)?;
        conditions.push((column_index(table, &column, table_name)?, value));
        if !c.eat("AND") {
            break;
        }
    }
    if !c.is_done() {
        return Err(unsupported_where());
    }
    Ok(conditions)
}

fn unsupported_where() -> TenancyError {
    TenancyError::database("memory backend supports only `column = value` conditions")
}

fn matches(row: &[String], conditions: &[(usize, String)]) -> bool {
    conditions
        .iter()
        .all(|(idx, value)| row.get(*idx).is_some_and(|v| v == value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unqualified_names_follow_search_path() {
        let db = MemoryDatabase::new();
        db.execute_in("public", "CREATE SCHEMA a; CREATE TABLE a.items (id int, name text)")
            .unwrap();
        let conn = db.acquire().await.unwrap();

        let err = conn.batch_execute("INSERT INTO items VALUES (1, 'x')").await.unwrap_err();
        assert!(err.is_undefined_relation());

        conn.batch_execute(r#"SET search_path TO "a", "public""#).await.unwrap();
        conn.batch_execute("INSERT INTO items VALUES (1, 'x')").await.unwrap();
        assert_eq!(conn.rows("items").unwrap(), vec![strings(&["1", "x"])]);
        assert_eq!(conn.search_path(), strings(&["a", "public"]));
    }

    #[tokio::test]
    async fn test_create_table_columns() {
        let db = MemoryDatabase::new();
        db.execute_in(
            "public",
            "CREATE TABLE t (id serial PRIMARY KEY, price numeric(10, 2) NOT NULL, \
             CONSTRAINT t_price CHECK (price > 0), \"Label\" text)",
        )
        .unwrap();
        assert_eq!(db.table("public", "t").unwrap().columns, strings(&["id", "price", "Label"]));
    }

    #[tokio::test]
    async fn test_alter_table_actions() {
        let db = MemoryDatabase::new();
        db.execute_in("public", "CREATE TABLE t (a int); INSERT INTO t VALUES (1)")
            .unwrap();
        db.execute_in("public", "ALTER TABLE t ADD COLUMN b text").unwrap();
        db.execute_in("public", "ALTER TABLE t RENAME COLUMN a TO c").unwrap();
        db.execute_in("public", "ALTER TABLE t DROP COLUMN IF EXISTS zz").unwrap();

        let table = db.table("public", "t").unwrap();
        assert_eq!(table.columns, strings(&["c", "b"]));
        assert_eq!(table.rows, vec![strings(&["1", "NULL"])]);

        db.execute_in("public", "ALTER TABLE t RENAME TO u").unwrap();
        assert_eq!(db.tables("public"), strings(&["u"]));

        let err = db.execute_in("public", "ALTER TABLE u ADD COLUMN b int").unwrap_err();
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let db = MemoryDatabase::new();
        db.execute_in(
            "public",
            "CREATE TABLE t (id int, name text, note text);\
             INSERT INTO t (name, id) VALUES ('one', 1), ('two', 2);",
        )
        .unwrap();
        db.execute_in("public", "UPDATE t SET note = 'hi' WHERE id = 2").unwrap();
        assert_eq!(
            db.rows("public", "t"),
            vec![strings(&["1", "one", "NULL"]), strings(&["2", "two", "hi"])]
        );

        db.execute_in("public", "DELETE FROM t WHERE name = 'one'").unwrap();
        assert_eq!(db.rows("public", "t"), vec![strings(&["2", "two", "hi"])]);

        let err = db.execute_in("public", "DELETE FROM t WHERE id > 1").unwrap_err();
        assert!(err.message.contains("column = value"));
    }

    #[tokio::test]
    async fn test_index_catalog() {
        let db = MemoryDatabase::new();
        db.execute_in(TEMPLATE_SCHEMA, "CREATE TABLE t (id int); CREATE INDEX t_id ON t (id)")
            .unwrap();
        let conn = db.acquire().await.unwrap();

        assert_eq!(
            conn.index_owner("t_id", &[TEMPLATE_SCHEMA, "public"]).await.unwrap(),
            Some("t".to_string())
        );
        assert_eq!(conn.index_owner("t_id", &["public"]).await.unwrap(), None);

        db.execute_in(TEMPLATE_SCHEMA, "ALTER INDEX t_id RENAME TO t_ident").unwrap();
        assert!(db.table(TEMPLATE_SCHEMA, "t").unwrap().indexes.contains("t_ident"));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let db = MemoryDatabase::new();
        let conn = db.acquire().await.unwrap();
        conn.batch_execute("BEGIN; CREATE TABLE t (id int); SET search_path TO x")
            .await
            .unwrap();

        let err = conn.batch_execute("CREATE TABLE t (id int)").await;
        assert!(err.is_err());
        let err = conn.batch_execute("SELECT 1").await.unwrap_err();
        assert!(err.message.contains("transaction is aborted"));

        conn.rollback().await.unwrap();
        assert!(db.tables("public").is_empty());
        assert_eq!(conn.search_path(), strings(&["public"]));
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let db = MemoryDatabase::new();
        let conn = db.acquire().await.unwrap();
        conn.begin().await.unwrap();
        conn.batch_execute("CREATE TABLE t (id int)").await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(db.tables("public"), strings(&["t"]));
    }

    #[tokio::test]
    async fn test_store_clones_rows() {
        let db = MemoryDatabase::new();
        db.execute_in(TEMPLATE_SCHEMA, "CREATE TABLE kinds (id int); INSERT INTO kinds VALUES (1)")
            .unwrap();
        let schema = Schema::restore(
            SchemaName::parse("acme").unwrap(),
            "Acme",
            true,
            [1],
            chrono::Utc::now(),
        );
        db.create(&schema, &SchemaRef::Template).await.unwrap();

        assert_eq!(db.rows("acme", "kinds"), vec![strings(&["1"])]);
        let err = db.create(&schema, &SchemaRef::Template).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(err.context.constraint.as_deref(), Some("tenantry_schema_pkey"));

        db.delete(&schema.name).await.unwrap();
        assert!(!db.schema_exists("acme").await.unwrap());
    }
}

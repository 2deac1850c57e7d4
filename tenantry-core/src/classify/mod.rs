//! Statement classification.
//!
//! Finds the table a DDL or DML statement targets and whether the statement
//! names a schema explicitly. This is not a SQL parser: it recognises a fixed
//! set of statement shapes and reports everything else as unrouted.
//!
//! | Statement | Result |
//! |-----------|--------|
//! | `CREATE/ALTER/DROP ... FUNCTION` (and procedures, sequences, types, ...) | unrouted |
//! | `CREATE/ALTER/DROP TABLE`, `VIEW`, `MATERIALIZED VIEW`, `FOREIGN TABLE` | the object |
//! | `CREATE INDEX ... ON t`, `CREATE/ALTER/DROP TRIGGER ... ON t` | the owning table `t` |
//! | `DROP INDEX i`, `ALTER INDEX i` | owner of `i` looked up in the catalog |
//! | `INSERT INTO t`, `UPDATE t`, `DELETE FROM t` | `t` |
//! | anything else | unrouted |

mod lexer;

pub use lexer::split_statements;
pub(crate) use lexer::{Token, tokenize};

use tracing::warn;

use crate::connection::Catalog;
use crate::error::TenancyResult;

/// A possibly schema-qualified object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    /// Schema qualifier, if written.
    pub schema: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectName {
    /// An unqualified name.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// A schema-qualified name.
    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

/// The syntactic shape of a statement, before any catalog lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementShape {
    /// Not subject to routing.
    Unrouted,
    /// Targets a table or view.
    Table(ObjectName),
    /// Targets an index whose owning table is not written in the statement.
    Index(ObjectName),
}

/// Where a statement points: `(table, schema)`, either possibly absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementTarget {
    /// Target table.
    pub table: Option<String>,
    /// Explicit schema qualifier.
    pub schema: Option<String>,
}

impl StatementTarget {
    /// Neither table nor schema resolved.
    pub fn unrouted() -> Self {
        Self::default()
    }

    /// Check if nothing was resolved.
    pub fn is_unrouted(&self) -> bool {
        self.table.is_none() && self.schema.is_none()
    }
}

impl From<ObjectName> for StatementTarget {
    fn from(name: ObjectName) -> Self {
        Self {
            table: Some(name.name),
            schema: name.schema,
        }
    }
}

/// Determine the shape of a single statement.
pub fn parse_statement(sql: &str) -> StatementShape {
    let tokens: Vec<Token> = tokenize(sql).into_iter().map(|s| s.token).collect();
    let mut cursor = Cursor::new(&tokens);

    let shape = if cursor.eat("CREATE") {
        parse_create(&mut cursor)
    } else if cursor.eat("DROP") {
        parse_drop(&mut cursor)
    } else if cursor.eat("ALTER") {
        parse_alter(&mut cursor)
    } else if cursor.eat("INSERT") {
        cursor.eat("INTO");
        cursor.object_name().map(StatementShape::Table)
    } else if cursor.eat("UPDATE") {
        cursor.eat("ONLY");
        cursor.object_name().map(StatementShape::Table)
    } else if cursor.eat("DELETE") {
        cursor.eat("FROM");
        cursor.eat("ONLY");
        cursor.object_name().map(StatementShape::Table)
    } else {
        None
    };

    shape.unwrap_or(StatementShape::Unrouted)
}

/// Classify a statement, consulting the catalog for index owners.
///
/// Unqualified index statements are resolved against the `search` schemas,
/// in order. The fan-out engine passes the template and the public schema.
pub async fn classify<C>(sql: &str, catalog: &C, search: &[&str]) -> TenancyResult<StatementTarget>
where
    C: Catalog + ?Sized,
{
    match parse_statement(sql) {
        StatementShape::Unrouted => Ok(StatementTarget::unrouted()),
        StatementShape::Table(name) => Ok(name.into()),
        StatementShape::Index(ObjectName {
            schema: Some(schema),
            ..
        }) => Ok(StatementTarget {
            table: None,
            schema: Some(schema),
        }),
        StatementShape::Index(ObjectName { name, .. }) => {
            match catalog.index_owner(&name, search).await? {
                Some(table) => Ok(StatementTarget {
                    table: Some(table),
                    schema: None,
                }),
                None => {
                    warn!(index = %name, "No table owns this index, executing once");
                    Ok(StatementTarget::unrouted())
                }
            }
        }
    }
}

fn parse_create(cursor: &mut Cursor<'_>) -> Option<StatementShape> {
    cursor.eat_sequence(&["OR", "REPLACE"]);
    while cursor.eat_any(&[
        "TEMP",
        "TEMPORARY",
        "UNLOGGED",
        "GLOBAL",
        "LOCAL",
        "UNIQUE",
        "MATERIALIZED",
        "FOREIGN",
        "CONSTRAINT",
        "RECURSIVE",
    ]) {}

    if cursor.eat("TABLE") || cursor.eat("VIEW") {
        cursor.eat_sequence(&["IF", "NOT", "EXISTS"]);
        return cursor.object_name().map(StatementShape::Table);
    }

    if cursor.eat("INDEX") {
        cursor.eat("CONCURRENTLY");
        cursor.eat_sequence(&["IF", "NOT", "EXISTS"]);
        if !cursor.peek_is("ON") {
            cursor.object_name()?;
        }
        cursor.expect("ON")?;
        cursor.eat("ONLY");
        return cursor.object_name().map(StatementShape::Table);
    }

    if cursor.eat("TRIGGER") {
        cursor.object_name()?;
        cursor.skip_to("ON")?;
        return cursor.object_name().map(StatementShape::Table);
    }

    None
}

fn parse_drop(cursor: &mut Cursor<'_>) -> Option<StatementShape> {
    cursor.eat_any(&["MATERIALIZED", "FOREIGN"]);

    if cursor.eat("TABLE") || cursor.eat("VIEW") {
        cursor.eat_sequence(&["IF", "EXISTS"]);
        return cursor.object_name().map(StatementShape::Table);
    }

    if cursor.eat("INDEX") {
        cursor.eat("CONCURRENTLY");
        cursor.eat_sequence(&["IF", "EXISTS"]);
        return cursor.object_name().map(StatementShape::Index);
    }

    if cursor.eat("TRIGGER") {
        cursor.eat_sequence(&["IF", "EXISTS"]);
        cursor.object_name()?;
        cursor.expect("ON")?;
        return cursor.object_name().map(StatementShape::Table);
    }

    None
}

fn parse_alter(cursor: &mut Cursor<'_>) -> Option<StatementShape> {
    cursor.eat_any(&["MATERIALIZED", "FOREIGN"]);

    if cursor.eat("TABLE") || cursor.eat("VIEW") {
        if cursor.peek_is("ALL") {
            return None;
        }
        cursor.eat_sequence(&["IF", "EXISTS"]);
        cursor.eat("ONLY");
        return cursor.object_name().map(StatementShape::Table);
    }

    if cursor.eat("INDEX") {
        if cursor.peek_is("ALL") {
            return None;
        }
        cursor.eat_sequence(&["IF", "EXISTS"]);
        return cursor.object_name().map(StatementShape::Index);
    }

    if cursor.eat("TRIGGER") {
        cursor.object_name()?;
        cursor.expect("ON")?;
        return cursor.object_name().map(StatementShape::Table);
    }

    None
}

/// Forward-only reader over tokens.
pub(crate) struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub(crate) fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub(crate) fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos >= self.tokens.len() || self.peek() == Some(&Token::Semicolon)
    }

    pub(crate) fn peek_is(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    /// Consume the keyword if it is next.
    pub(crate) fn eat(&mut self, keyword: &str) -> bool {
        if self.peek_is(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn eat_token(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume the first matching keyword.
    pub(crate) fn eat_any(&mut self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.eat(k))
    }

    /// Consume all keywords in order, or none of them.
    pub(crate) fn eat_sequence(&mut self, keywords: &[&str]) -> bool {
        let matches = keywords
            .iter()
            .enumerate()
            .all(|(i, k)| self.tokens.get(self.pos + i).is_some_and(|t| t.is_keyword(k)));
        if matches {
            self.pos += keywords.len();
        }
        matches
    }

    pub(crate) fn expect(&mut self, keyword: &str) -> Option<()> {
        self.eat(keyword).then_some(())
    }

    /// Advance past the next top-level occurrence of the keyword.
    pub(crate) fn skip_to(&mut self, keyword: &str) -> Option<()> {
        let mut depth = 0usize;
        while let Some(token) = self.advance() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                t if depth == 0 && t.is_keyword(keyword) => return Some(()),
                _ => {}
            }
        }
        None
    }

    pub(crate) fn identifier(&mut self) -> Option<String> {
        let ident = self.peek()?.identifier()?;
        self.pos += 1;
        Some(ident)
    }

    /// Read `name`, `schema.name` or `catalog.schema.name`.
    pub(crate) fn object_name(&mut self) -> Option<ObjectName> {
        let mut parts = vec![self.identifier()?];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            parts.push(self.identifier()?);
        }
        let name = parts.pop()?;
        Some(ObjectName {
            schema: parts.pop(),
            name,
        })
    }
}

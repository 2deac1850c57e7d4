//! Error types for tenancy operations.
//!
//! Every failure carries an [`ErrorCode`] for programmatic handling, a
//! human readable message and optional context about the schema, statement
//! and operation involved.
//!
//! # Error Codes
//!
//! Error codes follow a pattern: T{category}{number}
//! - 1xxx: Validation errors (identifier pattern, uniqueness, immutability)
//! - 2xxx: Selection errors (forbidden, template activation, selection required)
//! - 3xxx: Lookup errors
//! - 4xxx: Database errors
//! - 5xxx: Configuration errors
//! - 9xxx: Internal errors
//!
//! ```rust
//! use tenantry_core::{ErrorCode, TenancyError};
//!
//! let err = TenancyError::not_found("acme");
//! assert_eq!(err.code, ErrorCode::SchemaNotFound);
//! assert_eq!(err.code.code(), "T3001");
//!
//! let err = TenancyError::invalid_name("Acme", "must be lowercase");
//! assert!(err.is_validation());
//! assert_eq!(err.http_status(), 400);
//! ```

use std::fmt;
use thiserror::Error;

/// Result type for tenancy operations.
pub type TenancyResult<T> = Result<T, TenancyError>;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Validation errors (1xxx)
    /// Identifier does not match the naming rule (T1001).
    InvalidSchemaName = 1001,
    /// Identifier already registered (T1002).
    DuplicateSchemaName = 1002,
    /// Display name already registered (T1003).
    DuplicateDisplayName = 1003,
    /// Attempt to change a persisted identifier (T1004).
    SchemaNameImmutable = 1004,
    /// Attempt to use the reserved template identifier (T1005).
    ReservedSchemaName = 1005,

    // Selection errors (2xxx)
    /// Principal may not select the requested schema (T2001).
    Forbidden = 2001,
    /// The template schema can never be the acting schema (T2002).
    TemplateActivation = 2002,
    /// A tenant table was queried with no schema selected (T2003).
    SelectionRequired = 2003,

    // Lookup errors (3xxx)
    /// No schema with the requested identifier (T3001).
    SchemaNotFound = 3001,

    // Database errors (4xxx)
    /// Relation does not exist in the current search path (T4001).
    UndefinedRelation = 4001,
    /// Unique constraint violated by the database (T4002).
    UniqueViolation = 4002,
    /// Any other database failure (T4003).
    Database = 4003,
    /// Could not obtain a connection (T4004).
    ConnectionFailed = 4004,

    // Configuration errors (5xxx)
    /// Invalid configuration value (T5001).
    InvalidConfiguration = 5001,
    /// A table was declared both shared and tenant-scoped (T5002).
    ConflictingTableScope = 5002,

    // Internal errors (9xxx)
    /// Internal error (T9001).
    Internal = 9001,
}

impl ErrorCode {
    /// Get the error code string (e.g., "T1001").
    pub fn code(&self) -> String {
        format!("T{}", *self as u16)
    }

    /// Get a short description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidSchemaName => "Invalid schema name",
            Self::DuplicateSchemaName => "Schema name already in use",
            Self::DuplicateDisplayName => "Display name already in use",
            Self::SchemaNameImmutable => "Schema name may not change after creation",
            Self::ReservedSchemaName => "Reserved schema name",
            Self::Forbidden => "Schema selection forbidden",
            Self::TemplateActivation => "Template schema may not be activated",
            Self::SelectionRequired => "Schema selection required",
            Self::SchemaNotFound => "Schema not found",
            Self::UndefinedRelation => "Relation does not exist",
            Self::UniqueViolation => "Unique constraint violation",
            Self::Database => "Database error",
            Self::ConnectionFailed => "Database connection failed",
            Self::InvalidConfiguration => "Invalid configuration",
            Self::ConflictingTableScope => "Conflicting table scope",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Additional context for an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation that was being performed.
    pub operation: Option<String>,
    /// The schema involved.
    pub schema: Option<String>,
    /// The statement being executed (if available).
    pub sql: Option<String>,
    /// Help text.
    pub help: Option<String>,
    /// Name of the violated constraint, if the database reported one.
    pub constraint: Option<String>,
}

/// Errors that can occur during tenancy operations.
#[derive(Error, Debug)]
pub struct TenancyError {
    /// The error code.
    pub code: ErrorCode,
    /// The error message.
    pub message: String,
    /// Additional context.
    pub context: ErrorContext,
    /// The source error (if any).
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for TenancyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl TenancyError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Add context about the operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.context.schema = Some(schema.into());
        self
    }

    /// Set the statement.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.context.sql = Some(sql.into());
        self
    }

    /// Add help text.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.context.help = Some(help.into());
        self
    }

    /// Record the violated constraint.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.context.constraint = Some(constraint.into());
        self
    }

    /// Set the source error.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // ============== Constructor Functions ==============

    /// Identifier failed the naming rule.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::InvalidSchemaName,
            format!("Invalid schema name {:?}: {}", name, reason.into()),
        )
        .with_schema(name)
        .with_help("Schema names start with a lowercase letter and contain only a-z, 0-9 and _")
    }

    /// Identifier is the reserved template name.
    pub fn reserved_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::ReservedSchemaName,
            format!("Schema name {:?} is reserved", name),
        )
        .with_schema(name)
    }

    /// Identifier is already registered.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::DuplicateSchemaName,
            format!("Schema {:?} already exists", name),
        )
        .with_schema(name)
    }

    /// Display name is already registered.
    pub fn duplicate_display_name(display_name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DuplicateDisplayName,
            format!("Display name {:?} is already in use", display_name.into()),
        )
    }

    /// Attempt to rename a persisted schema.
    pub fn immutable_name(persisted: impl Into<String>, requested: impl Into<String>) -> Self {
        let persisted = persisted.into();
        Self::new(
            ErrorCode::SchemaNameImmutable,
            format!(
                "May not change schema name after creation ({:?} -> {:?})",
                persisted,
                requested.into()
            ),
        )
        .with_schema(persisted)
    }

    /// Schema missing from the registry.
    pub fn not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::SchemaNotFound, format!("No schema named {:?}", name))
            .with_schema(name)
    }

    /// Principal may not select the schema.
    pub fn forbidden(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::Forbidden,
            format!("You may not select schema {:?}", name),
        )
        .with_schema(name)
    }

    /// Attempt to make the template the acting schema.
    pub fn template_activation() -> Self {
        Self::new(
            ErrorCode::TemplateActivation,
            "The template schema may not be activated",
        )
        .with_schema(crate::identifier::TEMPLATE_SCHEMA)
    }

    /// A tenant table was reached without a selected schema.
    pub fn selection_required() -> Self {
        Self::new(
            ErrorCode::SelectionRequired,
            "You must select a schema to access that resource",
        )
    }

    /// Relation missing from the search path.
    pub fn undefined_relation(relation: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UndefinedRelation,
            format!("relation \"{}\" does not exist", relation.into()),
        )
    }

    /// Unique constraint violated by the database.
    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UniqueViolation, message)
    }

    /// General database failure.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Database, message)
    }

    /// Connection could not be obtained.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConnectionFailed,
            format!("Connection error: {}", message.into()),
        )
    }

    /// Invalid configuration value.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// Table declared with two scopes.
    pub fn conflicting_scope(table: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConflictingTableScope,
            format!(
                "Table {:?} is declared both shared and tenant-scoped",
                table.into()
            ),
        )
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Internal,
            format!("Internal error: {}", message.into()),
        )
    }

    // ============== Error Checks ==============

    /// Check if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::InvalidSchemaName
                | ErrorCode::DuplicateSchemaName
                | ErrorCode::DuplicateDisplayName
                | ErrorCode::SchemaNameImmutable
                | ErrorCode::ReservedSchemaName
        )
    }

    /// Check if the selection was refused.
    ///
    /// Unknown schemas count as refused so callers cannot probe which
    /// schemas exist.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Forbidden | ErrorCode::TemplateActivation | ErrorCode::SchemaNotFound
        )
    }

    /// Check if this is a template activation error.
    pub fn is_template_activation(&self) -> bool {
        self.code == ErrorCode::TemplateActivation
    }

    /// Check if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::SchemaNotFound
    }

    /// Check if the database reported a missing relation.
    pub fn is_undefined_relation(&self) -> bool {
        self.code == ErrorCode::UndefinedRelation
    }

    /// Check if this is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        self.code == ErrorCode::UniqueViolation
    }

    /// HTTP status code a client should see for this error.
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::InvalidSchemaName
            | ErrorCode::DuplicateSchemaName
            | ErrorCode::DuplicateDisplayName
            | ErrorCode::SchemaNameImmutable
            | ErrorCode::ReservedSchemaName => 400,
            // Unknown schemas answer like forbidden ones so existence never leaks.
            ErrorCode::Forbidden | ErrorCode::TemplateActivation | ErrorCode::SchemaNotFound => {
                403
            }
            ErrorCode::SelectionRequired => 449,
            ErrorCode::UniqueViolation => 409,
            ErrorCode::ConnectionFailed => 503,
            ErrorCode::UndefinedRelation
            | ErrorCode::Database
            | ErrorCode::InvalidConfiguration
            | ErrorCode::ConflictingTableScope
            | ErrorCode::Internal => 500,
        }
    }

    /// Display the full error with all context.
    pub fn display_full(&self) -> String {
        let mut output = format!("Error [{}]: {}\n", self.code.code(), self.message);

        if let Some(ref op) = self.context.operation {
            output.push_str(&format!("  → While: {}\n", op));
        }
        if let Some(ref schema) = self.context.schema {
            output.push_str(&format!("  → Schema: {}\n", schema));
        }
        if let Some(ref sql) = self.context.sql {
            let sql_display = match sql.char_indices().nth(200) {
                Some((idx, _)) => format!("{}...", &sql[..idx]),
                None => sql.clone(),
            };
            output.push_str(&format!("  → SQL: {}\n", sql_display));
        }
        if let Some(ref constraint) = self.context.constraint {
            output.push_str(&format!("  → Constraint: {}\n", constraint));
        }
        if let Some(ref help) = self.context.help {
            output.push_str(&format!("\nHelp: {}\n", help));
        }

        output
    }
}

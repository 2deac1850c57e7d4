//! Configuration for schema routing, loaded from `tenantry.toml`.
//!
//! ```toml
//! public_schema = "public"
//! shared_tables = ["auth_user", "django_session"]
//!
//! [selection]
//! header = "X-Change-Schema"
//!
//! [database]
//! url = "${DATABASE_URL}"
//! ```

use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{TenancyError, TenancyResult};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenancyConfig {
    /// Schema holding shared tables and the registry.
    #[serde(default = "default_public_schema")]
    pub public_schema: String,

    /// Tables that live once in the public schema.
    #[serde(default)]
    pub shared_tables: Vec<String>,

    /// Request selection settings.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log every search path change at info level instead of debug.
    #[serde(default)]
    pub log_schema_changes: bool,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            public_schema: default_public_schema(),
            shared_tables: Vec::new(),
            selection: SelectionConfig::default(),
            database: DatabaseConfig::default(),
            log_schema_changes: false,
        }
    }
}

impl TenancyConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> TenancyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TenancyError::config(format!("failed to read {}", path.display())).with_source(e)
        })?;

        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// `${VAR}` references are replaced with the environment value before
    /// parsing. The result is validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> TenancyResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)
            .map_err(|e| TenancyError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the public schema.
    pub fn with_public_schema(mut self, schema: impl Into<String>) -> Self {
        self.public_schema = schema.into();
        self
    }

    /// Mark a table as shared.
    pub fn with_shared_table(mut self, table: impl Into<String>) -> Self {
        self.shared_tables.push(table.into());
        self
    }

    /// Replace the selection settings.
    pub fn with_selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    /// Set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = Some(url.into());
        self
    }

    /// Log search path changes at info level.
    pub fn with_schema_change_logging(mut self) -> Self {
        self.log_schema_changes = true;
        self
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> TenancyResult<()> {
        if self.public_schema.trim().is_empty() {
            return Err(TenancyError::config("public_schema must not be empty"));
        }
        let prefix = &self.selection.change_path_prefix;
        if prefix.len() < 2 || !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(TenancyError::config(format!(
                "selection.change_path_prefix must start and end with '/', got {:?}",
                prefix
            )));
        }
        if self.selection.query_param.is_empty() || self.selection.header.is_empty() {
            return Err(TenancyError::config(
                "selection.query_param and selection.header must not be empty",
            ));
        }
        if !(100..=999).contains(&self.selection.selection_required_status) {
            return Err(TenancyError::config(format!(
                "selection.selection_required_status {} is not an HTTP status",
                self.selection.selection_required_status
            )));
        }
        Ok(())
    }
}

fn default_public_schema() -> String {
    "public".to_string()
}

/// How a request asks for a schema.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    /// Path prefix of the change endpoint, followed by `<identifier>/`.
    #[serde(default = "default_change_path_prefix")]
    pub change_path_prefix: String,

    /// Query string parameter.
    #[serde(default = "default_query_param")]
    pub query_param: String,

    /// Request header.
    #[serde(default = "default_header")]
    pub header: String,

    /// Status returned when a tenant table is reached without a selection.
    #[serde(default = "default_selection_required_status")]
    pub selection_required_status: u16,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            change_path_prefix: default_change_path_prefix(),
            query_param: default_query_param(),
            header: default_header(),
            selection_required_status: default_selection_required_status(),
        }
    }
}

fn default_change_path_prefix() -> String {
    "/__change_schema__/".to_string()
}
fn default_query_param() -> String {
    "__schema".to_string()
}
fn default_header() -> String {
    "X-Change-Schema".to_string()
}
fn default_selection_required_status() -> u16 {
    449
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL (supports `${ENV_VAR}` interpolation).
    pub url: Option<String>,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> usize {
    10
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Expand environment variables in the format `${VAR_NAME}`.
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex_lite::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

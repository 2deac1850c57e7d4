//! Database objects tenantry relies on.
//!
//! [`bootstrap`] installs, idempotently:
//!
//! - the template schema
//! - the registry tables in the public schema, with the identifier rules as
//!   `CHECK` constraints
//! - a trigger refusing to change a registered identifier
//! - `clone_schema(source, target)`, which copies every table (with rows),
//!   sequence, foreign key and view of one schema into a new one

use tenantry_core::{
    MAX_SCHEMA_NAME_LEN, TEMPLATE_SCHEMA, TenancyConfig, TenancyResult, quote_ident,
    tables::{DISPLAY_NAME_CONSTRAINT, SCHEMA_TABLE, SCHEMA_USERS_TABLE},
};
use tracing::info;

use crate::connection::PgConnection;
use crate::error::PgError;

/// PL/pgSQL body of `clone_schema(source, target)`.
///
/// Sequences are copied with their current value and column defaults that
/// referenced the source's sequences are re-pointed at the copies. Identity
/// columns get their own sequence in the target, advanced to the source's
/// position.
pub const CLONE_SCHEMA_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION {public}.clone_schema(source text, target text) RETURNS void AS $clone$
DECLARE
    object record;
    seq_value bigint;
    seq_called boolean;
    definition text;
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = source) THEN
        RAISE EXCEPTION 'schema "%" does not exist', source USING ERRCODE = 'invalid_schema_name';
    END IF;

    EXECUTE format('CREATE SCHEMA %I', target);

    FOR object IN
        SELECT c.relname FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = source AND c.relkind = 'S'
          AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = c.oid AND d.deptype = 'i')
    LOOP
        EXECUTE format('CREATE SEQUENCE %I.%I', target, object.relname);
        EXECUTE format('SELECT last_value FROM %I.%I', source, object.relname) INTO seq_value;
        EXECUTE format(
            'SELECT setval(%L, %s, true)',
            quote_ident(target) || '.' || quote_ident(object.relname),
            seq_value
        );
    END LOOP;

    FOR object IN
        SELECT c.relname FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = source AND c.relkind IN ('r', 'p')
        ORDER BY c.oid
    LOOP
        EXECUTE format(
            'CREATE TABLE %I.%I (LIKE %I.%I INCLUDING ALL)',
            target, object.relname, source, object.relname
        );
        EXECUTE format(
            'INSERT INTO %I.%I OVERRIDING SYSTEM VALUE SELECT * FROM %I.%I',
            target, object.relname, source, object.relname
        );
    END LOOP;

    FOR object IN
        SELECT c.relname, a.attname
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = source AND c.relkind IN ('r', 'p')
          AND a.attidentity <> '' AND a.attnum > 0 AND NOT a.attisdropped
    LOOP
        EXECUTE format(
            'SELECT last_value, is_called FROM %s',
            pg_get_serial_sequence(
                quote_ident(source) || '.' || quote_ident(object.relname),
                object.attname
            )
        ) INTO seq_value, seq_called;
        PERFORM setval(
            pg_get_serial_sequence(
                quote_ident(target) || '.' || quote_ident(object.relname),
                object.attname
            ),
            seq_value,
            seq_called
        );
    END LOOP;

    FOR object IN
        SELECT a.attrelid::regclass::text AS table_name, a.attname,
               pg_get_expr(d.adbin, d.adrelid) AS expr
        FROM pg_attrdef d
        JOIN pg_attribute a ON a.attrelid = d.adrelid AND a.attnum = d.adnum
        JOIN pg_class c ON c.oid = d.adrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = target AND pg_get_expr(d.adbin, d.adrelid) LIKE 'nextval(%'
    LOOP
        EXECUTE format(
            'ALTER TABLE %s ALTER COLUMN %I SET DEFAULT %s',
            object.table_name, object.attname,
            replace(object.expr, quote_ident(source) || '.', quote_ident(target) || '.')
        );
    END LOOP;

    FOR object IN
        SELECT c.conrelid::regclass AS rel, c.conname, pg_get_constraintdef(c.oid) AS def, t.relname
        FROM pg_constraint c
        JOIN pg_class t ON t.oid = c.conrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = source AND c.contype = 'f'
    LOOP
        definition := replace(
            object.def,
            'REFERENCES ' || quote_ident(source) || '.',
            'REFERENCES ' || quote_ident(target) || '.'
        );
        EXECUTE format(
            'ALTER TABLE %I.%I ADD CONSTRAINT %I %s',
            target, object.relname, object.conname, definition
        );
    END LOOP;

    FOR object IN
        SELECT c.relname, pg_get_viewdef(c.oid) AS def
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = source AND c.relkind = 'v'
        ORDER BY c.oid
    LOOP
        EXECUTE format('SET LOCAL search_path TO %I, {public}', target);
        EXECUTE format('CREATE VIEW %I.%I AS %s', target, object.relname, object.def);
    END LOOP;
END;
$clone$ LANGUAGE plpgsql;
"#;

/// Refuses changes to a registered identifier.
pub const REJECT_RENAME_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION {public}.tenantry_reject_rename() RETURNS trigger AS $reject$
BEGIN
    IF NEW.name <> OLD.name THEN
        RAISE EXCEPTION 'schema name cannot be changed from "%" to "%"', OLD.name, NEW.name
            USING ERRCODE = 'check_violation';
    END IF;
    RETURN NEW;
END;
$reject$ LANGUAGE plpgsql;
"#;

/// Render the statements that set up a database, for the given public
/// schema.
pub fn bootstrap_sql(public_schema: &str) -> String {
    let public = quote_ident(public_schema);
    let template = quote_ident(TEMPLATE_SCHEMA);
    let schema_table = format!("{}.{}", public, quote_ident(SCHEMA_TABLE));
    let users_table = format!("{}.{}", public, quote_ident(SCHEMA_USERS_TABLE));

    let mut sql = format!(
        r#"CREATE SCHEMA IF NOT EXISTS {template};

CREATE TABLE IF NOT EXISTS {schema_table} (
    name varchar({max}) PRIMARY KEY
        CHECK (name ~ '^[a-z][a-z0-9_]*$' AND name <> '{template_name}'),
    display_name varchar(128) NOT NULL CHECK (display_name <> ''),
    is_active boolean NOT NULL DEFAULT true,
    created_at timestamptz NOT NULL DEFAULT now(),
    CONSTRAINT {display_key} UNIQUE (display_name)
);

CREATE TABLE IF NOT EXISTS {users_table} (
    schema_name varchar({max}) NOT NULL REFERENCES {schema_table} (name) ON DELETE CASCADE,
    user_id bigint NOT NULL,
    PRIMARY KEY (schema_name, user_id)
);
"#,
        max = MAX_SCHEMA_NAME_LEN,
        template_name = TEMPLATE_SCHEMA,
        display_key = DISPLAY_NAME_CONSTRAINT,
    );

    sql.push_str(&REJECT_RENAME_FUNCTION.replace("{public}", &public));
    sql.push_str(&format!(
        "\nDROP TRIGGER IF EXISTS tenantry_reject_rename ON {schema_table};\n\
         CREATE TRIGGER tenantry_reject_rename BEFORE UPDATE ON {schema_table} \
         FOR EACH ROW EXECUTE FUNCTION {public}.tenantry_reject_rename();\n"
    ));
    sql.push_str(&CLONE_SCHEMA_FUNCTION.replace("{public}", &public));
    sql
}

/// Install the template schema, registry tables, trigger and clone function.
pub async fn bootstrap(conn: &PgConnection, config: &TenancyConfig) -> TenancyResult<()> {
    let sql = bootstrap_sql(&config.public_schema);
    conn.client()
        .batch_execute(&sql)
        .await
        .map_err(PgError::from)?;
    info!(public_schema = %config.public_schema, "Tenancy objects installed");
    Ok(())
}

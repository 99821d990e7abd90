//! Declarative table definitions and the schema registry.
//!
//! Entities describe their table through [`Entity::TABLE`]. All entities are
//! registered once, at startup, into an immutable [`Metadata`] which renders
//! the DDL and is handed explicitly to whatever creates or drops the schema.

use crate::connection::Engine;
use crate::error::DbError;
use crate::naming::{ConstraintKind, NameParts, NamingConvention};
use sqlx::postgres::{PgRow, Postgres};
use sqlx::query_builder::Separated;
use sqlx::FromRow;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Uuid,
    Double,
    Timestamp,
    TimestampTz,
    Varchar(u16),
    Text,
}

impl SqlType {
    pub fn ddl(&self) -> String {
        match self {
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Timestamp => "TIMESTAMP WITHOUT TIME ZONE".to_string(),
            SqlType::TimestampTz => "TIMESTAMP WITH TIME ZONE".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({len})"),
            SqlType::Text => "TEXT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub column: &'static str,
}

/// A single column. Built with the `const` builder methods so that tables
/// can be declared as associated constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub index: bool,
    pub server_default: Option<&'static str>,
    pub references: Option<ForeignKey>,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: true,
            primary_key: false,
            unique: false,
            index: false,
            server_default: None,
            references: None,
        }
    }

    /// Primary key columns are implicitly `NOT NULL`.
    pub const fn primary_key(self) -> Self {
        Self {
            primary_key: true,
            nullable: false,
            ..self
        }
    }

    pub const fn not_null(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    pub const fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    pub const fn index(self) -> Self {
        Self {
            index: true,
            ..self
        }
    }

    pub const fn server_default(self, expression: &'static str) -> Self {
        Self {
            server_default: Some(expression),
            ..self
        }
    }

    pub const fn references(self, table: &'static str, column: &'static str) -> Self {
        Self {
            references: Some(ForeignKey { table, column }),
            ..self
        }
    }
}

/// A named `CHECK` constraint. The name is fed to the naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub expression: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub checks: &'static [Check],
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn primary_key(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name)
            .collect()
    }
}

/// A row type backed by a table.
///
/// The table definition is an associated constant, so a type cannot be an
/// entity without declaring its table name and columns.
pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static {
    const TABLE: Table;
}

/// A row waiting to be inserted. The table's primary key is generated by
/// the database and returned on insert.
pub trait NewRow: Send + Sync + fmt::Debug {
    fn table_name(&self) -> &'static str;

    /// The columns written by [`NewRow::push_binds`], in the same order.
    fn columns(&self) -> &'static [&'static str];

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>);
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The registry of every table in the application.
///
/// Built once through [`MetadataBuilder`]; immutable afterwards. Tables are
/// kept in registration order, which must respect foreign keys (a table can
/// only reference tables registered before it).
#[derive(Debug, Clone)]
pub struct Metadata {
    convention: NamingConvention,
    tables: Vec<Table>,
    create_statements: Vec<String>,
}

#[derive(Debug)]
pub struct MetadataBuilder {
    convention: NamingConvention,
    tables: Vec<Table>,
}

impl MetadataBuilder {
    pub fn register<E: Entity>(self) -> Self {
        self.table(E::TABLE)
    }

    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    /// Validates the registered tables and renders their DDL.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Schema`] for duplicate tables or columns, tables
    /// without a primary key, or foreign keys to tables or columns that were
    /// not registered earlier, and [`DbError::NamingConvention`] when a
    /// constraint name cannot be rendered.
    pub fn build(self) -> Result<Metadata, DbError> {
        let mut seen: Vec<&Table> = Vec::with_capacity(self.tables.len());
        let mut create_statements = Vec::new();

        for table in &self.tables {
            if seen.iter().any(|t| t.name == table.name) {
                return Err(DbError::Schema(format!("table '{}' is registered twice", table.name)));
            }

            let mut columns = HashSet::new();
            for column in table.columns {
                if !columns.insert(column.name) {
                    return Err(DbError::Schema(format!(
                        "column '{}' appears twice in table '{}'",
                        column.name, table.name
                    )));
                }
                if let Some(fk) = column.references {
                    let target = seen
                        .iter()
                        .chain(std::iter::once(&table))
                        .find(|t| t.name == fk.table)
                        .ok_or_else(|| {
                            DbError::Schema(format!(
                                "'{}.{}' references unknown table '{}'",
                                table.name, column.name, fk.table
                            ))
                        })?;
                    if target.column(fk.column).is_none() {
                        return Err(DbError::Schema(format!(
                            "'{}.{}' references unknown column '{}.{}'",
                            table.name, column.name, fk.table, fk.column
                        )));
                    }
                }
            }

            if table.primary_key().is_empty() {
                return Err(DbError::Schema(format!("table '{}' has no primary key", table.name)));
            }

            create_statements.extend(table_ddl(table, &self.convention)?);
            seen.push(table);
        }

        Ok(Metadata {
            convention: self.convention,
            tables: self.tables,
            create_statements,
        })
    }
}

impl Metadata {
    pub fn builder(convention: NamingConvention) -> MetadataBuilder {
        MetadataBuilder {
            convention,
            tables: Vec::new(),
        }
    }

    pub fn naming_convention(&self) -> &NamingConvention {
        &self.convention
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// `CREATE TABLE` / `CREATE INDEX` statements, in dependency order.
    /// Every statement is `IF NOT EXISTS`, so running them twice is harmless.
    pub fn create_statements(&self) -> &[String] {
        &self.create_statements
    }

    /// `DROP TABLE` statements, dependents first.
    pub fn drop_statements(&self) -> Vec<String> {
        self.tables
            .iter()
            .rev()
            .map(|t| format!("DROP TABLE IF EXISTS {}", quote_ident(t.name)))
            .collect()
    }

    /// Creates every missing table and index in a single transaction.
    pub async fn create_all(&self, engine: &Engine) -> Result<(), DbError> {
        let mut tx = engine.pool().begin().await?;
        for statement in &self.create_statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!(tables = self.tables.len(), "Schema is up to date.");
        Ok(())
    }

    /// Drops every registered table in a single transaction.
    pub async fn drop_all(&self, engine: &Engine) -> Result<(), DbError> {
        let mut tx = engine.pool().begin().await?;
        for statement in self.drop_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::warn!(tables = self.tables.len(), "Dropped database schema.");
        Ok(())
    }
}

fn table_ddl(table: &Table, convention: &NamingConvention) -> Result<Vec<String>, DbError> {
    let parts = |column: Option<&'static str>| NameParts {
        table_name: table.name,
        column_0_name: column,
        ..Default::default()
    };

    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut line = format!("{} {}", quote_ident(column.name), column.sql_type.ddl());
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = column.server_default {
                line.push_str(" DEFAULT ");
                line.push_str(default);
            }
            line
        })
        .collect();

    let primary_key = table.primary_key();
    let pk_name =
        convention.name(ConstraintKind::PrimaryKey, &parts(primary_key.first().copied()))?;
    lines.push(format!(
        "CONSTRAINT {} PRIMARY KEY ({})",
        quote_ident(&pk_name),
        primary_key.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    ));

    for column in table.columns.iter().filter(|c| c.unique) {
        let name = convention.name(ConstraintKind::Unique, &parts(Some(column.name)))?;
        lines.push(format!(
            "CONSTRAINT {} UNIQUE ({})",
            quote_ident(&name),
            quote_ident(column.name)
        ));
    }

    for column in table.columns {
        if let Some(fk) = column.references {
            let name = convention.name(
                ConstraintKind::ForeignKey,
                &NameParts {
                    referred_table_name: Some(fk.table),
                    ..parts(Some(column.name))
                },
            )?;
            lines.push(format!(
                "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&name),
                quote_ident(column.name),
                quote_ident(fk.table),
                quote_ident(fk.column)
            ));
        }
    }

    for check in table.checks {
        let name = convention.name(
            ConstraintKind::Check,
            &NameParts {
                constraint_name: Some(check.name),
                ..parts(None)
            },
        )?;
        lines.push(format!("CONSTRAINT {} CHECK ({})", quote_ident(&name), check.expression));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(table.name),
        lines.join(",\n    ")
    )];

    for column in table.columns.iter().filter(|c| c.index) {
        let name = convention.name(ConstraintKind::Index, &parts(Some(column.name)))?;
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&name),
            quote_ident(table.name),
            quote_ident(column.name)
        ));
    }

    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Depthseries, Role, User, UserRole};

    #[test]
    fn depthseries_ddl_uses_the_naming_convention() {
        let metadata = Metadata::builder(NamingConvention::default())
            .register::<Depthseries>()
            .build()
            .unwrap();

        assert_eq!(
            metadata.create_statements(),
            &[
                "CREATE TABLE IF NOT EXISTS \"depthseries\" (\n    \
                 \"id\" UUID NOT NULL DEFAULT gen_random_uuid(),\n    \
                 \"depth\" DOUBLE PRECISION NOT NULL,\n    \
                 \"value\" DOUBLE PRECISION,\n    \
                 CONSTRAINT \"pk_depthseries\" PRIMARY KEY (\"id\")\n)"
                    .to_string(),
                "CREATE INDEX IF NOT EXISTS \"ix_depthseries_id\" ON \"depthseries\" (\"id\")"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn foreign_keys_and_uniques_are_named() {
        let metadata = Metadata::builder(NamingConvention::default())
            .register::<User>()
            .register::<Role>()
            .register::<UserRole>()
            .build()
            .unwrap();

        let ddl = metadata.create_statements().join("\n");
        assert!(ddl.contains("CONSTRAINT \"uq_users_name\" UNIQUE (\"name\")"));
        assert!(ddl.contains("CONSTRAINT \"uq_users_email\" UNIQUE (\"email\")"));
        assert!(ddl.contains(
            "CONSTRAINT \"fk_user_roles_role_id_roles\" \
             FOREIGN KEY (\"role_id\") REFERENCES \"roles\" (\"id\")"
        ));
        assert!(ddl.contains("CONSTRAINT \"ck_users_name_not_blank\" CHECK"));
    }

    #[test]
    fn drop_order_is_reverse_registration_order() {
        let metadata = Metadata::builder(NamingConvention::default())
            .register::<User>()
            .register::<Role>()
            .register::<UserRole>()
            .build()
            .unwrap();

        assert_eq!(
            metadata.drop_statements(),
            vec![
                "DROP TABLE IF EXISTS \"user_roles\"",
                "DROP TABLE IF EXISTS \"roles\"",
                "DROP TABLE IF EXISTS \"users\"",
            ]
        );
    }

    #[test]
    fn builder_rejects_inconsistent_schemas() {
        let duplicate = Metadata::builder(NamingConvention::default())
            .register::<Depthseries>()
            .register::<Depthseries>()
            .build();
        assert!(matches!(duplicate, Err(DbError::Schema(_))));

        // user_roles references tables that were not registered first.
        let dangling = Metadata::builder(NamingConvention::default())
            .register::<UserRole>()
            .build();
        assert!(matches!(dangling, Err(DbError::Schema(_))));

        const NO_KEY: Table = Table {
            name: "keyless",
            columns: &[Column::new("value", SqlType::Double)],
            checks: &[],
        };
        let keyless = Metadata::builder(NamingConvention::default()).table(NO_KEY).build();
        assert!(matches!(keyless, Err(DbError::Schema(_))));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}

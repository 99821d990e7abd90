//! First-run database initialization: schema, admin account, version stamp.

use crate::connection::Engine;
use crate::error::DbError;
use crate::models::{NewRole, NewUser, NewUserRole, User};
use crate::schema::{Metadata, quote_ident};
use crate::session::{Session, SessionFactory};
use crate::transaction::{TransactionManager, get_tm_session};
use std::fmt;
use uuid::Uuid;

/// The table an external migration tool reads its current revision from.
pub const VERSION_TABLE: &str = "alembic_version";

/// The newest migration revision the schema in [`crate::models`] matches.
pub const HEAD_REVISION: &str = "3c1f0d2b9a4e";

#[derive(Clone)]
pub struct SeedOptions {
    pub admin_name: String,
    pub admin_email: String,
    pub admin_password: String,
    pub roles: Vec<String>,
    /// Drop every registered table before creating the schema.
    pub drop_all: bool,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            admin_name: "admin".to_string(),
            admin_email: "admin@vanoord.com".to_string(),
            admin_password: "admin".to_string(),
            roles: vec!["admin".to_string()],
            drop_all: false,
        }
    }
}

impl fmt::Debug for SeedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedOptions")
            .field("admin_name", &self.admin_name)
            .field("admin_email", &self.admin_email)
            .field("roles", &self.roles)
            .field("drop_all", &self.drop_all)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { admin_id: Uuid },
    /// At least one user already existed; nothing was written.
    AlreadySeeded,
}

/// Creates the schema and, on an empty database, the admin account with its
/// roles, all in one transaction. The version table is stamped only after a
/// successful seed.
pub async fn initialize_db(
    metadata: &Metadata,
    factory: &SessionFactory,
    options: &SeedOptions,
) -> Result<SeedOutcome, DbError> {
    let engine = factory.engine();
    if options.drop_all {
        tracing::warn!("Dropping database schema!");
        metadata.drop_all(engine).await?;
    }
    metadata.create_all(engine).await?;

    let transaction_manager = TransactionManager::new();
    let result = match get_tm_session(factory, &transaction_manager).await {
        Ok(session) => seed_accounts(&session, options).await,
        Err(e) => Err(e),
    };
    let outcome = transaction_manager.finish(result).await?;

    match outcome {
        SeedOutcome::Seeded { admin_id } => {
            tracing::info!(%admin_id, user = %options.admin_name, "Created admin account.");
            tracing::info!(revision = HEAD_REVISION, "Adding migration stamp...");
            stamp(engine, HEAD_REVISION).await?;
        }
        SeedOutcome::AlreadySeeded => {
            tracing::info!("Users already exist; skipping account seeding.");
        }
    }
    tracing::info!("Finished initializing database.");
    Ok(outcome)
}

async fn seed_accounts(session: &Session, options: &SeedOptions) -> Result<SeedOutcome, DbError> {
    if session.query::<User>().limit(1).one_or_none().await?.is_some() {
        return Ok(SeedOutcome::AlreadySeeded);
    }

    let admin_id = session
        .insert(NewUser::new(
            options.admin_name.clone(),
            options.admin_email.clone(),
            &options.admin_password,
        )?)
        .await?;

    for role_name in &options.roles {
        let role_id = session
            .insert(NewRole {
                name: role_name.clone(),
                created_by_user_id: Some(admin_id),
            })
            .await?;
        session
            .add(NewUserRole {
                role_id,
                user_id: admin_id,
                created_by_user_id: Some(admin_id),
            })
            .await?;
    }
    Ok(SeedOutcome::Seeded { admin_id })
}

fn version_table_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
         \"version_num\" VARCHAR(32) NOT NULL,\n    \
         CONSTRAINT {} PRIMARY KEY (\"version_num\")\n)",
        quote_ident(VERSION_TABLE),
        quote_ident(&format!("{VERSION_TABLE}_pkc"))
    )
}

/// Points the version table at `revision`, replacing whatever was there.
pub async fn stamp(engine: &Engine, revision: &str) -> Result<(), DbError> {
    let mut tx = engine.pool().begin().await?;
    sqlx::query(&version_table_ddl()).execute(&mut *tx).await?;
    sqlx::query(&format!("DELETE FROM {}", quote_ident(VERSION_TABLE)))
        .execute(&mut *tx)
        .await?;
    let insert = format!(
        "INSERT INTO {} (\"version_num\") VALUES ($1)",
        quote_ident(VERSION_TABLE)
    );
    sqlx::query(&insert)
        .bind(revision)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// The stamped revision, or `None` when the database was never stamped.
pub async fn current_revision(engine: &Engine) -> Result<Option<String>, DbError> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
        .bind(VERSION_TABLE)
        .fetch_one(engine.pool())
        .await?;
    if !exists {
        return Ok(None);
    }
    let select = format!("SELECT \"version_num\" FROM {} LIMIT 1", quote_ident(VERSION_TABLE));
    let revision: Option<String> = sqlx::query_scalar(&select)
        .fetch_optional(engine.pool())
        .await?;
    Ok(revision)
}

//! Users, roles and the assignments between them.

use super::ID;
use crate::error::DbError;
use crate::schema::{Check, Column, Entity, NewRow, SqlType, Table};
use crate::session::Session;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use std::fmt;
use uuid::Uuid;

#[derive(Clone, PartialEq, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl User {
    pub fn verify_password(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }
}

impl Entity for User {
    const TABLE: Table = Table {
        name: "users",
        columns: &[
            ID,
            Column::new("name", SqlType::Varchar(255)).not_null().unique(),
            Column::new("email", SqlType::Varchar(255)).not_null().unique(),
            Column::new("password_hash", SqlType::Text).not_null(),
            Column::new("created_at", SqlType::TimestampTz)
                .not_null()
                .server_default("now()"),
        ],
        checks: &[Check {
            name: "name_not_blank",
            expression: "btrim(\"name\") <> ''",
        }],
    };
}

/// A user to be created. The password is hashed on construction; the plain
/// text is never stored.
#[derive(Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    password_hash: String,
}

impl NewUser {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        password: &str,
    ) -> Result<Self, DbError> {
        Ok(Self {
            name: name.into(),
            email: email.into(),
            password_hash: hash_password(password)?,
        })
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("name", &self.name)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl NewRow for NewUser {
    fn table_name(&self) -> &'static str {
        User::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["name", "email", "password_hash"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.name.clone())
            .push_bind(self.email.clone())
            .push_bind(self.password_hash.clone());
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub created_by_user_id: Option<Uuid>,
}

impl Entity for Role {
    const TABLE: Table = Table {
        name: "roles",
        columns: &[
            ID,
            Column::new("name", SqlType::Varchar(255)).not_null().unique(),
            Column::new("created_by_user_id", SqlType::Uuid).references("users", "id"),
        ],
        checks: &[],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRole {
    pub name: String,
    pub created_by_user_id: Option<Uuid>,
}

impl NewRow for NewRole {
    fn table_name(&self) -> &'static str {
        Role::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["name", "created_by_user_id"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.name.clone())
            .push_bind(self.created_by_user_id);
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct UserRole {
    pub id: Uuid,
    pub role_id: Uuid,
    pub user_id: Uuid,
    pub created_by_user_id: Option<Uuid>,
}

impl Entity for UserRole {
    const TABLE: Table = Table {
        name: "user_roles",
        columns: &[
            ID,
            Column::new("role_id", SqlType::Uuid)
                .not_null()
                .index()
                .references("roles", "id"),
            Column::new("user_id", SqlType::Uuid)
                .not_null()
                .index()
                .references("users", "id"),
            Column::new("created_by_user_id", SqlType::Uuid).references("users", "id"),
        ],
        checks: &[],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserRole {
    pub role_id: Uuid,
    pub user_id: Uuid,
    pub created_by_user_id: Option<Uuid>,
}

impl NewRow for NewUserRole {
    fn table_name(&self) -> &'static str {
        UserRole::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["role_id", "user_id", "created_by_user_id"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.role_id)
            .push_bind(self.user_id)
            .push_bind(self.created_by_user_id);
    }
}

/// Hashes `password` with Argon2id and a random salt, in PHC string format.
pub fn hash_password(password: &str) -> Result<String, DbError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DbError::PasswordHash(e.to_string()))
}

/// `false` for a wrong password and for a malformed hash alike.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash is malformed.");
            false
        }
    }
}

pub async fn find_user_by_name(session: &Session, name: &str) -> Result<Option<User>, DbError> {
    session.query::<User>().filter_eq("name", name).one_or_none().await
}

/// The names of every role assigned to `user_id`, sorted.
pub async fn role_names_for_user(session: &Session, user_id: Uuid) -> Result<Vec<String>, DbError> {
    let assignments = session
        .query::<UserRole>()
        .filter_eq("user_id", user_id)
        .all()
        .await?;

    let mut names = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        if let Some(role) = session
            .query::<Role>()
            .filter_eq("id", assignment.role_id)
            .one_or_none()
            .await?
        {
            names.push(role.name);
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

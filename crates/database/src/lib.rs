//! # Case Interview Database Crate
//!
//! The persistence layer: it owns the schema and every conversation with
//! PostgreSQL.
//!
//! ## Architectural Principles
//!
//! - **Explicit Schema Registry:** Tables are declared by the entity types
//!   themselves ([`Entity::TABLE`]) and collected once, at startup, into an
//!   immutable [`Metadata`]. Constraint and index names come from a single
//!   [`NamingConvention`], so the DDL is deterministic.
//! - **Unit of Work:** A [`Session`] queues new rows and runs queries inside
//!   one lazily-begun transaction. It joins a [`TransactionManager`], which
//!   alone decides whether that work is committed or rolled back.
//! - **Asynchronous & Pooled:** All I/O is async over a lazily-connecting
//!   `PgPool` wrapped in an [`Engine`].
//!
//! ## Public API
//!
//! - `get_engine`: builds the pool from prefixed settings.
//! - `get_session_factory` / `get_tm_session`: produce sessions bound to a
//!   transaction.
//! - `models::metadata`: the registry of every application table.
//! - `initialize_db`: creates the schema and seeds the admin account.
//! - `DbError`: the error type returned by everything in this crate.

pub mod connection;
pub mod error;
pub mod models;
pub mod naming;
pub mod schema;
pub mod seed;
pub mod session;
pub mod transaction;

pub use connection::{Engine, get_engine};
pub use error::DbError;
pub use naming::{ConstraintKind, NamingConvention};
pub use schema::{Entity, Metadata, NewRow, Table};
pub use seed::{HEAD_REVISION, SeedOptions, SeedOutcome, current_revision, initialize_db, stamp};
pub use session::{
    OrderedQuery, Outcome, Query, QueryWrapper, Session, SessionFactory, TracedQuery,
    get_session_factory, query_wrapper_by_name,
};
pub use transaction::{TransactionManager, TransactionStatus, get_tm_session};

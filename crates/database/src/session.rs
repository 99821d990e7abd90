//! Units of work.
//!
//! A [`Session`] collects pending rows and runs queries inside one database
//! transaction, begun lazily on first use. It is finished exactly once, by
//! the transaction manager it joined (see [`crate::transaction`]), and
//! rejects any use afterwards.

use crate::connection::Engine;
use crate::error::DbError;
use crate::schema::{Entity, NewRow, quote_ident};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{QueryBuilder, Transaction};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A value compared against a column in [`Query::filter_eq`].
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Uuid(Uuid),
    Text(String),
}

impl From<Uuid> for FilterValue {
    fn from(value: Uuid) -> Self {
        FilterValue::Uuid(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

/// A `SELECT` against a single table, before it is rendered to SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub primary_key: Vec<&'static str>,
    pub filters: Vec<(&'static str, FilterValue)>,
    pub order_by: Vec<&'static str>,
    pub limit: Option<i64>,
}

impl Select {
    pub fn for_entity<E: Entity>() -> Self {
        Self {
            table: E::TABLE.name,
            columns: E::TABLE.column_names(),
            primary_key: E::TABLE.primary_key(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// The SQL text, with `$n` placeholders for filter values.
    pub fn to_sql(&self) -> String {
        self.build().sql().to_string()
    }

    fn validate(&self) -> Result<(), DbError> {
        let referenced = self
            .filters
            .iter()
            .map(|(column, _)| *column)
            .chain(self.order_by.iter().copied());
        for column in referenced {
            if !self.columns.contains(&column) {
                return Err(DbError::UnknownColumn {
                    table: self.table,
                    column,
                });
            }
        }
        Ok(())
    }

    fn build(&self) -> QueryBuilder<'static, Postgres> {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let mut builder = QueryBuilder::new(format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            quote_ident(self.table)
        ));

        for (i, (column, value)) in self.filters.iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            builder.push(quote_ident(column));
            builder.push(" = ");
            match value {
                FilterValue::Uuid(id) => builder.push_bind(*id),
                FilterValue::Text(text) => builder.push_bind(text.clone()),
            };
        }

        if !self.order_by.is_empty() {
            let order: Vec<String> = self.order_by.iter().map(|c| quote_ident(c)).collect();
            builder.push(" ORDER BY ");
            builder.push(order.join(", "));
        }

        if let Some(limit) = self.limit {
            builder.push(format!(" LIMIT {limit}"));
        }
        builder
    }
}

/// Rewrites every `SELECT` a session runs.
///
/// Configured once per session factory (the `query_cls` setting), so query
/// behaviour can be extended without touching the session itself.
pub trait QueryWrapper: Send + Sync + fmt::Debug {
    fn wrap(&self, select: Select) -> Select;
}

/// Logs each statement at debug level and leaves it unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracedQuery;

impl QueryWrapper for TracedQuery {
    fn wrap(&self, select: Select) -> Select {
        tracing::debug!(sql = %select.to_sql(), "Running query.");
        select
    }
}

/// Gives unordered queries a stable order: first value column, then the
/// primary key.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderedQuery;

impl QueryWrapper for OrderedQuery {
    fn wrap(&self, mut select: Select) -> Select {
        if select.order_by.is_empty() {
            let first_value = select
                .columns
                .iter()
                .copied()
                .find(|c| !select.primary_key.contains(c));
            if let Some(column) = first_value {
                select.order_by.push(column);
            }
            select.order_by.extend(select.primary_key.iter().copied());
        }
        select
    }
}

/// Looks up a query wrapper by its configured name.
pub fn query_wrapper_by_name(name: &str) -> Result<Arc<dyn QueryWrapper>, DbError> {
    match name.trim() {
        "traced" => Ok(Arc::new(TracedQuery)),
        "ordered" => Ok(Arc::new(OrderedQuery)),
        other => Err(DbError::UnknownQueryWrapper(other.to_string())),
    }
}

/// Stamps out sessions bound to one engine. Immutable and cheap to clone.
#[derive(Clone)]
pub struct SessionFactory {
    engine: Engine,
    query_wrapper: Option<Arc<dyn QueryWrapper>>,
}

impl SessionFactory {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn query_wrapper(&self) -> Option<&dyn QueryWrapper> {
        self.query_wrapper.as_deref()
    }

    /// A fresh session. Nothing touches the database until it is used.
    pub fn create(&self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                pool: self.engine.pool().clone(),
                query_wrapper: self.query_wrapper.clone(),
                state: Mutex::new(SessionState {
                    phase: Phase::Idle,
                    pending: Vec::new(),
                }),
            }),
        }
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("engine", &self.engine)
            .field("query_wrapper", &self.query_wrapper)
            .finish()
    }
}

pub fn get_session_factory(
    engine: &Engine,
    query_wrapper: Option<Arc<dyn QueryWrapper>>,
) -> SessionFactory {
    SessionFactory {
        engine: engine.clone(),
        query_wrapper,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

enum Phase {
    Idle,
    Active(Transaction<'static, Postgres>),
    Closed(Outcome),
}

struct SessionState {
    phase: Phase,
    pending: Vec<Box<dyn NewRow>>,
}

struct SessionInner {
    id: Uuid,
    pool: PgPool,
    query_wrapper: Option<Arc<dyn QueryWrapper>>,
    state: Mutex<SessionState>,
}

/// A handle to a unit of work. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

impl Session {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn query<E: Entity>(&self) -> Query<'_, E> {
        Query {
            session: self,
            select: Select::for_entity::<E>(),
            _entity: PhantomData,
        }
    }

    /// Queues a row for insertion at the next flush.
    pub async fn add<R: NewRow + 'static>(&self, row: R) -> Result<(), DbError> {
        let mut state = self.inner.state.lock().await;
        if let Phase::Closed(_) = state.phase {
            return Err(DbError::SessionClosed);
        }
        state.pending.push(Box::new(row));
        Ok(())
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// `None` while the session is open.
    pub async fn outcome(&self) -> Option<Outcome> {
        match self.inner.state.lock().await.phase {
            Phase::Closed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Sends every pending row to the database, returning their generated ids
    /// in insertion order. The rows stay invisible to other sessions until
    /// the transaction commits.
    pub async fn flush(&self) -> Result<Vec<Uuid>, DbError> {
        let mut state = self.inner.state.lock().await;
        let SessionState { phase, pending } = &mut *state;
        if pending.is_empty() {
            return match phase {
                Phase::Closed(_) => Err(DbError::SessionClosed),
                _ => Ok(Vec::new()),
            };
        }
        let tx = transaction(&self.inner.pool, phase).await?;
        flush_rows(tx, pending).await
    }

    /// Adds and flushes a single row, returning its generated id.
    pub async fn insert<R: NewRow + 'static>(&self, row: R) -> Result<Uuid, DbError> {
        self.add(row).await?;
        let ids = self.flush().await?;
        ids.last().copied().ok_or(DbError::SessionClosed)
    }

    async fn fetch<E: Entity>(&self, select: Select) -> Result<Vec<E>, DbError> {
        let select = match &self.inner.query_wrapper {
            Some(wrapper) => wrapper.wrap(select),
            None => select,
        };
        select.validate()?;

        let mut state = self.inner.state.lock().await;
        let SessionState { phase, pending } = &mut *state;
        let tx = transaction(&self.inner.pool, phase).await?;
        if !pending.is_empty() {
            flush_rows(tx, pending).await?;
        }

        let mut builder = select.build();
        let rows = builder.build_query_as::<E>().fetch_all(&mut **tx).await?;
        Ok(rows)
    }

    /// Ends the session: flush + commit, or roll back. Called by the
    /// transaction manager; a session can only be finished once.
    pub(crate) async fn finish(&self, commit: bool) -> Result<(), DbError> {
        let mut state = self.inner.state.lock().await;
        if let Phase::Closed(_) = state.phase {
            return Err(DbError::SessionClosed);
        }

        if !commit {
            state.pending.clear();
            let phase = std::mem::replace(&mut state.phase, Phase::Closed(Outcome::RolledBack));
            if let Phase::Active(tx) = phase {
                tx.rollback().await?;
            }
            tracing::debug!(session = %self.inner.id, "Session rolled back.");
            return Ok(());
        }

        let result = commit_state(&self.inner.pool, &mut state).await;
        state.pending.clear();
        state.phase = Phase::Closed(match result {
            Ok(()) => Outcome::Committed,
            Err(_) => Outcome::RolledBack,
        });
        match &result {
            Ok(()) => tracing::debug!(session = %self.inner.id, "Session committed."),
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "Session commit failed.")
            }
        }
        result
    }
}

/// The session's transaction, begun on first use.
async fn transaction<'a>(
    pool: &PgPool,
    phase: &'a mut Phase,
) -> Result<&'a mut Transaction<'static, Postgres>, DbError> {
    if matches!(phase, Phase::Idle) {
        *phase = Phase::Active(pool.begin().await?);
    }
    match phase {
        Phase::Active(tx) => Ok(tx),
        _ => Err(DbError::SessionClosed),
    }
}

async fn flush_rows(
    tx: &mut Transaction<'static, Postgres>,
    pending: &mut Vec<Box<dyn NewRow>>,
) -> Result<Vec<Uuid>, DbError> {
    let rows = std::mem::take(pending);
    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        ids.push(insert_row(tx, row.as_ref()).await?);
    }
    Ok(ids)
}

async fn insert_row(
    tx: &mut Transaction<'static, Postgres>,
    row: &dyn NewRow,
) -> Result<Uuid, DbError> {
    let columns: Vec<String> = row.columns().iter().map(|c| quote_ident(c)).collect();
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({}) ",
        quote_ident(row.table_name()),
        columns.join(", ")
    ));
    builder.push_values(std::iter::once(row), |mut values, row| row.push_binds(&mut values));
    builder.push(" RETURNING \"id\"");

    let id = builder.build_query_scalar::<Uuid>().fetch_one(&mut **tx).await?;
    Ok(id)
}

async fn commit_state(pool: &PgPool, state: &mut SessionState) -> Result<(), DbError> {
    let SessionState { phase, pending } = state;
    if !pending.is_empty() {
        let tx = transaction(pool, phase).await?;
        flush_rows(tx, pending).await?;
    }
    if let Phase::Active(tx) = std::mem::replace(phase, Phase::Idle) {
        tx.commit().await?;
    }
    Ok(())
}

/// A typed `SELECT` bound to a session.
pub struct Query<'s, E> {
    session: &'s Session,
    select: Select,
    _entity: PhantomData<fn() -> E>,
}

impl<'s, E: Entity> Query<'s, E> {
    pub fn filter_eq(mut self, column: &'static str, value: impl Into<FilterValue>) -> Self {
        self.select.filters.push((column, value.into()));
        self
    }

    pub fn order_by(mut self, column: &'static str) -> Self {
        self.select.order_by.push(column);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.select.limit = Some(limit);
        self
    }

    pub fn statement(&self) -> &Select {
        &self.select
    }

    pub async fn all(self) -> Result<Vec<E>, DbError> {
        self.session.fetch(self.select).await
    }

    pub async fn first(self) -> Result<Option<E>, DbError> {
        Ok(self.limit(1).all().await?.into_iter().next())
    }

    /// At most one row; more than one is an error.
    pub async fn one_or_none(mut self) -> Result<Option<E>, DbError> {
        self.select.limit = Some(self.select.limit.map_or(2, |limit| limit.min(2)));
        let table = self.select.table;
        let mut rows = self.all().await?;
        if rows.len() > 1 {
            return Err(DbError::MultipleResultsFound(table));
        }
        Ok(rows.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::get_engine;
    use crate::models::{NewDepthseries, Timeseries};
    use configuration::{DEFAULT_PREFIX, Settings};

    fn factory(wrapper: Option<Arc<dyn QueryWrapper>>) -> SessionFactory {
        // Nothing listens on port 1; these tests never reach the database.
        let settings: Settings = [("sqlalchemy.url", "postgresql://test:pw@127.0.0.1:1/test")]
            .into_iter()
            .collect();
        let engine = get_engine(&settings, DEFAULT_PREFIX).unwrap();
        get_session_factory(&engine, wrapper)
    }

    #[test]
    fn select_renders_filters_order_and_limit() {
        let mut select = Select::for_entity::<Timeseries>();
        select.filters.push(("id", FilterValue::Uuid(Uuid::nil())));
        select.order_by.push("datetime");
        select.limit = Some(5);

        assert_eq!(
            select.to_sql(),
            "SELECT \"id\", \"datetime\", \"value\" FROM \"timeseries\" \
             WHERE \"id\" = $1 ORDER BY \"datetime\" LIMIT 5"
        );
    }

    #[test]
    fn ordered_wrapper_only_orders_unordered_queries() {
        let wrapped = OrderedQuery.wrap(Select::for_entity::<Timeseries>());
        assert_eq!(wrapped.order_by, vec!["datetime", "id"]);

        let mut explicit = Select::for_entity::<Timeseries>();
        explicit.order_by.push("value");
        assert_eq!(OrderedQuery.wrap(explicit).order_by, vec!["value"]);
    }

    #[test]
    fn wrappers_are_found_by_name() {
        assert!(query_wrapper_by_name("ordered").is_ok());
        assert!(query_wrapper_by_name(" traced ").is_ok());
        assert!(matches!(
            query_wrapper_by_name("myapp.query.Custom"),
            Err(DbError::UnknownQueryWrapper(_))
        ));
    }

    #[tokio::test]
    async fn sessions_from_one_factory_are_distinct() {
        let factory = factory(None);
        let a = factory.create();
        let b = factory.create();

        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
    }

    #[tokio::test]
    async fn pending_rows_belong_to_their_own_session() {
        let factory = factory(None);
        let a = factory.create();
        let b = factory.create();

        a.add(NewDepthseries { depth: 1.0, value: Some(2.0) }).await.unwrap();
        b.add(NewDepthseries { depth: 3.0, value: None }).await.unwrap();
        b.add(NewDepthseries { depth: 4.0, value: None }).await.unwrap();

        a.finish(false).await.unwrap();

        assert_eq!(a.pending_len().await, 0);
        assert_eq!(a.outcome().await, Some(Outcome::RolledBack));
        assert_eq!(b.pending_len().await, 2);
        assert_eq!(b.outcome().await, None);
    }

    #[tokio::test]
    async fn finished_sessions_reject_further_use() {
        let session = factory(None).create();
        // Nothing was queued or queried, so committing never opens a connection.
        session.finish(true).await.unwrap();
        assert_eq!(session.outcome().await, Some(Outcome::Committed));

        assert!(matches!(
            session.add(NewDepthseries { depth: 1.0, value: None }).await,
            Err(DbError::SessionClosed)
        ));
        assert!(matches!(session.flush().await, Err(DbError::SessionClosed)));
        assert!(matches!(
            session.query::<Timeseries>().all().await,
            Err(DbError::SessionClosed)
        ));
        assert!(matches!(session.finish(false).await, Err(DbError::SessionClosed)));
    }

    #[tokio::test]
    async fn unknown_columns_fail_before_reaching_the_database() {
        let session = factory(Some(Arc::new(OrderedQuery))).create();
        let result = session
            .query::<Timeseries>()
            .filter_eq("depth", Uuid::nil())
            .all()
            .await;

        assert!(matches!(
            result,
            Err(DbError::UnknownColumn { table: "timeseries", column: "depth" })
        ));
    }

    #[tokio::test]
    async fn factory_carries_its_query_wrapper() {
        assert!(factory(None).query_wrapper().is_none());
        assert!(factory(Some(Arc::new(TracedQuery))).query_wrapper().is_some());
    }
}

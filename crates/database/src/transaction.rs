//! The transaction manager sessions join.
//!
//! A [`TransactionManager`] marks the boundary of one logical transaction
//! (one web request, or one explicit block in the seeding command). At most
//! one session joins it; committing or aborting the manager commits or rolls
//! back that session, after which both are closed for good.

use crate::error::DbError;
use crate::session::{Session, SessionFactory};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct ManagerState {
    status: TransactionStatus,
    session: Option<Session>,
}

#[derive(Debug)]
pub struct TransactionManager {
    state: Mutex<ManagerState>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                status: TransactionStatus::Active,
                session: None,
            }),
        }
    }

    pub async fn status(&self) -> TransactionStatus {
        self.state.lock().await.status
    }

    /// Registers `session` as this transaction's participant.
    pub async fn join(&self, session: Session) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if state.status != TransactionStatus::Active {
            return Err(DbError::TransactionClosed);
        }
        if state.session.is_some() {
            return Err(DbError::AlreadyJoined);
        }
        state.session = Some(session);
        Ok(())
    }

    /// Flushes and commits the joined session, if any.
    ///
    /// A failed commit leaves the transaction aborted.
    pub async fn commit(&self) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if state.status != TransactionStatus::Active {
            return Err(DbError::TransactionClosed);
        }
        let result = match state.session.take() {
            Some(session) => session.finish(true).await,
            None => Ok(()),
        };
        state.status = match result {
            Ok(()) => TransactionStatus::Committed,
            Err(_) => TransactionStatus::Aborted,
        };
        result
    }

    /// Rolls back the joined session, if any. Aborting twice is a no-op;
    /// aborting a committed transaction is an error.
    pub async fn abort(&self) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        match state.status {
            TransactionStatus::Aborted => return Ok(()),
            TransactionStatus::Committed => return Err(DbError::TransactionClosed),
            TransactionStatus::Active => {}
        }
        state.status = TransactionStatus::Aborted;
        match state.session.take() {
            Some(session) => session.finish(false).await,
            None => Ok(()),
        }
    }

    /// Ends the transaction according to `result`: commit on `Ok`, abort on
    /// `Err`. The original error wins over a failure to abort.
    pub async fn finish<T, E>(&self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<DbError>,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_error) = self.abort().await {
                    tracing::error!(error = %abort_error, "Failed to abort transaction.");
                }
                Err(e)
            }
        }
    }
}

/// Creates a session from `factory` and joins it to `transaction_manager`,
/// so the session lives and dies with that transaction.
pub async fn get_tm_session(
    factory: &SessionFactory,
    transaction_manager: &TransactionManager,
) -> Result<Session, DbError> {
    let session = factory.create();
    transaction_manager.join(session.clone()).await?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::get_engine;
    use crate::models::NewTimeseries;
    use crate::session::{Outcome, get_session_factory};
    use chrono::NaiveDate;
    use configuration::{DEFAULT_PREFIX, Settings};

    fn factory() -> SessionFactory {
        let settings: Settings = [("sqlalchemy.url", "postgresql://test:pw@127.0.0.1:1/test")]
            .into_iter()
            .collect();
        get_session_factory(&get_engine(&settings, DEFAULT_PREFIX).unwrap(), None)
    }

    fn reading() -> NewTimeseries {
        NewTimeseries {
            datetime: NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap(),
            value: Some(1.5),
        }
    }

    #[tokio::test]
    async fn one_session_per_transaction() {
        let factory = factory();
        let tm = TransactionManager::new();

        get_tm_session(&factory, &tm).await.unwrap();
        assert!(matches!(get_tm_session(&factory, &tm).await, Err(DbError::AlreadyJoined)));
    }

    #[tokio::test]
    async fn abort_rolls_back_the_session_and_closes_it() {
        let factory = factory();
        let tm = TransactionManager::new();
        let session = get_tm_session(&factory, &tm).await.unwrap();
        session.add(reading()).await.unwrap();

        tm.abort().await.unwrap();

        assert_eq!(tm.status().await, TransactionStatus::Aborted);
        assert_eq!(session.outcome().await, Some(Outcome::RolledBack));
        assert_eq!(session.pending_len().await, 0);
        assert!(matches!(session.add(reading()).await, Err(DbError::SessionClosed)));

        // Aborting again is harmless; committing is not.
        tm.abort().await.unwrap();
        assert!(matches!(tm.commit().await, Err(DbError::TransactionClosed)));
    }

    #[tokio::test]
    async fn commit_without_work_closes_the_session() {
        let factory = factory();
        let tm = TransactionManager::new();
        let session = get_tm_session(&factory, &tm).await.unwrap();

        tm.commit().await.unwrap();

        assert_eq!(tm.status().await, TransactionStatus::Committed);
        assert_eq!(session.outcome().await, Some(Outcome::Committed));
        assert!(matches!(tm.abort().await, Err(DbError::TransactionClosed)));
        assert!(matches!(
            get_tm_session(&factory, &tm).await,
            Err(DbError::TransactionClosed)
        ));
    }

    #[tokio::test]
    async fn concurrent_transactions_do_not_share_sessions() {
        let factory = factory();
        let (tm_a, tm_b) = (TransactionManager::new(), TransactionManager::new());
        let a = get_tm_session(&factory, &tm_a).await.unwrap();
        let b = get_tm_session(&factory, &tm_b).await.unwrap();
        assert_ne!(a, b);

        a.add(reading()).await.unwrap();
        b.add(reading()).await.unwrap();
        tm_a.abort().await.unwrap();

        assert_eq!(b.pending_len().await, 1);
        assert_eq!(b.outcome().await, None);
        assert_eq!(tm_b.status().await, TransactionStatus::Active);
    }

    #[tokio::test]
    async fn finish_maps_results_to_commit_or_abort() {
        let factory = factory();

        let tm = TransactionManager::new();
        get_tm_session(&factory, &tm).await.unwrap();
        let ok: Result<u8, DbError> = tm.finish(Ok(7)).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(tm.status().await, TransactionStatus::Committed);

        let tm = TransactionManager::new();
        get_tm_session(&factory, &tm).await.unwrap();
        let err: Result<u8, DbError> = tm.finish(Err(DbError::MultipleResultsFound("users"))).await;
        assert!(matches!(err, Err(DbError::MultipleResultsFound("users"))));
        assert_eq!(tm.status().await, TransactionStatus::Aborted);
    }
}

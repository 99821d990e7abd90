//! One transaction per request.
//!
//! [`transaction_middleware`] opens a [`RequestScope`] for every request and
//! ends its transaction once the response is known: error statuses abort,
//! everything else commits. Handlers reach the scope through the
//! [`RequestScope`] and [`DbSession`] extractors; the session is created on
//! first access and reused for the rest of the request.
//!
//! The caller's user name is read from the identity proxy header named by
//! the `auth.trusted_header` setting. Without that setting every request is
//! anonymous, whatever headers it carries.

use crate::AppState;
use crate::authorization::{Acl, Identity};
use crate::error::AppError;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderName, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use database::models::{find_user_by_name, role_names_for_user};
use database::{DbError, Session, SessionFactory, TransactionManager, get_tm_session};
use std::sync::Arc;
use tokio::sync::OnceCell;

struct ScopeInner {
    factory: SessionFactory,
    transaction_manager: TransactionManager,
    acl: Arc<Acl>,
    remote_user: Option<String>,
    session: OnceCell<Session>,
    identity: OnceCell<Identity>,
}

/// Everything tied to a single request's transaction.
#[derive(Clone)]
pub struct RequestScope {
    inner: Arc<ScopeInner>,
}

impl RequestScope {
    pub fn new(factory: SessionFactory, acl: Arc<Acl>, remote_user: Option<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                factory,
                transaction_manager: TransactionManager::new(),
                acl,
                remote_user,
                session: OnceCell::new(),
                identity: OnceCell::new(),
            }),
        }
    }

    /// A scope whose caller is already known.
    #[cfg(test)]
    pub(crate) fn signed_in(factory: SessionFactory, acl: Arc<Acl>, identity: Identity) -> Self {
        let remote_user = identity.user.as_ref().map(|user| user.name.clone());
        Self {
            inner: Arc::new(ScopeInner {
                factory,
                transaction_manager: TransactionManager::new(),
                acl,
                remote_user,
                session: OnceCell::new(),
                identity: OnceCell::new_with(Some(identity)),
            }),
        }
    }

    /// The user name taken from the trusted identity header, if any.
    pub fn remote_user(&self) -> Option<&str> {
        self.inner.remote_user.as_deref()
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.inner.transaction_manager
    }

    /// The request's session, created and joined to the request's
    /// transaction on first call.
    pub async fn session(&self) -> Result<Session, DbError> {
        self.inner
            .session
            .get_or_try_init(|| {
                get_tm_session(&self.inner.factory, &self.inner.transaction_manager)
            })
            .await
            .cloned()
    }

    /// Whether a session was handed out during this request.
    pub fn has_session(&self) -> bool {
        self.inner.session.initialized()
    }

    /// The caller, resolved once from the trusted identity header. Unknown
    /// users are treated as anonymous.
    pub async fn identity(&self) -> Result<&Identity, DbError> {
        self.inner.identity.get_or_try_init(|| self.resolve_identity()).await
    }

    async fn resolve_identity(&self) -> Result<Identity, DbError> {
        let Some(name) = self.inner.remote_user.as_deref() else {
            return Ok(Identity::anonymous());
        };
        let session = self.session().await?;
        match find_user_by_name(&session, name).await? {
            Some(user) => {
                let roles = role_names_for_user(&session, user.id).await?;
                Ok(Identity {
                    user: Some(user),
                    roles,
                })
            }
            None => {
                tracing::debug!(user = name, "Remote user is unknown; treating as anonymous.");
                Ok(Identity::anonymous())
            }
        }
    }

    pub async fn permits(&self, permission: &str) -> Result<bool, DbError> {
        let identity = self.identity().await?;
        Ok(self.inner.acl.permits(&identity.effective_principals(), permission))
    }

    /// Fails with 403 unless the caller holds `permission`.
    pub async fn require(&self, permission: &'static str) -> Result<&Identity, AppError> {
        if !self.permits(permission).await? {
            return Err(AppError::Forbidden(permission));
        }
        Ok(self.identity().await?)
    }

    /// Like [`RequestScope::require`], but anonymous callers are sent to the
    /// login page instead of being refused.
    pub async fn require_page(&self, permission: &'static str) -> Result<&Identity, AppError> {
        let authenticated = self.identity().await?.is_authenticated();
        match self.require(permission).await {
            Err(AppError::Forbidden(_)) if !authenticated => Err(AppError::LoginRequired),
            outcome => outcome,
        }
    }
}

fn remote_user(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Wraps every routed request in its own transaction.
pub async fn transaction_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = state
        .trusted_header
        .as_ref()
        .and_then(|header| remote_user(request.headers(), header));
    let scope = RequestScope::new(state.session_factory.clone(), state.acl.clone(), user);
    request.extensions_mut().insert(scope.clone());

    let response = next.run(request).await;
    let status = response.status();
    let transaction_manager = scope.transaction_manager();

    if status.is_client_error() || status.is_server_error() {
        if let Err(e) = transaction_manager.abort().await {
            tracing::error!(error = %e, %status, "Failed to abort request transaction.");
        }
        return response;
    }

    match transaction_manager.commit().await {
        Ok(()) => response,
        Err(e) => AppError::Database(e).into_response(),
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestScope
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestScope>()
            .cloned()
            .ok_or_else(|| {
                AppError::Internal("the transaction middleware is not installed".to_string())
            })
    }
}

/// The request's database session.
pub struct DbSession(pub Session);

#[axum::async_trait]
impl<S> FromRequestParts<S> for DbSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let scope = RequestScope::from_request_parts(parts, state).await?;
        Ok(DbSession(scope.session().await?))
    }
}

use axum::{
    Router,
    http::{HeaderName, HeaderValue, header},
    middleware::from_fn_with_state,
    routing::get,
};
use configuration::{ConfigError, DEFAULT_PREFIX, Settings, resolve_connection_url};
use database::{
    Metadata, SessionFactory, get_engine, get_session_factory, models, query_wrapper_by_name,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};

pub mod authorization;
pub mod error;
pub mod handlers;
pub mod tm;

use authorization::Acl;
use error::AppError;

pub const DEFAULT_TITLE: &str = "Case Interview";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6543;
pub const STATIC_CACHE_MAX_AGE: &str = "max-age=3600";
/// Where anonymous visitors of protected pages are redirected.
pub const LOGIN_PATH: &str = "/login";

/// The shared application state that all handlers can access. Built once by
/// [`configure`] and never mutated afterwards.
#[derive(Debug)]
pub struct AppState {
    pub session_factory: SessionFactory,
    pub metadata: Metadata,
    pub settings: Settings,
    pub acl: Arc<Acl>,
    /// The identity proxy header carrying the user name. `None` makes every
    /// request anonymous.
    pub trusted_header: Option<HeaderName>,
    pub title: String,
    pub static_path: PathBuf,
}

/// Wires the database into the application. Runs once at startup.
///
/// Resolves the connection URL (writing the canonical form back into
/// `settings`), builds the engine and the session factory with the
/// `query_cls` wrapper, and registers the schema. `env` looks up the `PG_*`
/// environment variables.
///
/// The identity header is only trusted when `auth.trusted_header` names it;
/// set it only behind a proxy that strips the header from client requests.
pub fn configure<F>(settings: &mut Settings, env: F) -> Result<AppState, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    resolve_connection_url(settings, env)?;
    let engine = get_engine(settings, DEFAULT_PREFIX)?;

    let query_wrapper = settings.get("query_cls").map(query_wrapper_by_name).transpose()?;
    if let Some(wrapper) = &query_wrapper {
        tracing::info!(query_cls = ?wrapper, "Using query wrapper.");
    }
    let session_factory = get_session_factory(&engine, query_wrapper);

    let trusted_header = trusted_header(settings)?;
    match &trusted_header {
        Some(header) => tracing::info!(%header, "Trusting the identity proxy header."),
        None => tracing::info!("No identity header is trusted; every request is anonymous."),
    }

    Ok(AppState {
        session_factory,
        metadata: models::metadata()?,
        title: settings.get_or("app.title", DEFAULT_TITLE).to_string(),
        static_path: PathBuf::from(settings.get_or("static.path", "static")),
        acl: Arc::new(Acl::root()),
        trusted_header,
        settings: settings.clone(),
    })
}

fn trusted_header(settings: &Settings) -> Result<Option<HeaderName>, ConfigError> {
    let Some(name) = settings.get("auth.trusted_header").map(str::trim) else {
        return Ok(None);
    };
    if name.is_empty() {
        return Ok(None);
    }
    HeaderName::from_bytes(name.as_bytes()).map(Some).map_err(|_| {
        ConfigError::ValidationError(format!("auth.trusted_header '{name}' is not a header name"))
    })
}

/// All routes. Application routes run inside the per-request transaction;
/// static files do not.
pub fn build_router(state: Arc<AppState>) -> Router {
    let static_files = Router::new()
        .nest_service("/static", ServeDir::new(&state.static_path))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static(STATIC_CACHE_MAX_AGE),
        ));

    Router::new()
        .route("/", get(handlers::home))
        .route(LOGIN_PATH, get(handlers::login))
        .route("/users/create", get(handlers::user_form).post(handlers::create_user))
        .route("/api/health", get(handlers::health))
        .route("/api/timeseries", get(handlers::timeseries))
        .route("/api/depthseries", get(handlers::depthseries))
        .route("/api/activities", get(handlers::activities))
        .route_layer(from_fn_with_state(state.clone(), tm::transaction_middleware))
        .with_state(state)
        .merge(static_files)
        // This middleware will automatically log information about every incoming request.
        .layer(TraceLayer::new_for_http())
}

/// The main function to configure and run the web server.
pub async fn run_server(mut settings: Settings) -> anyhow::Result<()> {
    let state = Arc::new(configure(&mut settings, |key| std::env::var(key).ok())?);
    let engine = state.session_factory.engine().clone();

    let host = settings.get_or("server.host", DEFAULT_HOST);
    let port = settings.parse_or("server.port", DEFAULT_PORT)?;
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server started and listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.dispose().await;
    tracing::info!("Web server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for the shutdown signal.");
    }
}

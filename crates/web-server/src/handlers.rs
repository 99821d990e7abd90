use crate::{
    AppState,
    authorization::{MANAGE_USERS, READ},
    error::AppError,
    tm::{DbSession, RequestScope},
};
use axum::{
    Form, Json,
    extract::State,
    response::{Html, IntoResponse, Redirect, Response},
};
use database::models::{Activity, Depthseries, NewUser, Timeseries, find_user_by_name};
use serde::Deserialize;
use std::sync::Arc;

/// # GET /
/// The landing page. Admins also get the user management section.
pub async fn home(
    State(state): State<Arc<AppState>>,
    scope: RequestScope,
) -> Result<Html<String>, AppError> {
    let identity = scope.identity().await?;
    let mut body = String::new();

    if let Some(user) = &identity.user {
        body.push_str(&format!("<p>Signed in as {}.</p>\n", escape_html(&user.name)));
    }
    if scope.permits(MANAGE_USERS).await? {
        body.push_str(
            "<section>\n<h2>User Management</h2>\n\
             <p><a href=\"/users/create\">Create a user</a></p>\n</section>\n",
        );
    }

    Ok(Html(page(&state.title, &body)))
}

/// # GET /login
/// Where anonymous visitors of protected pages end up. Signing in happens
/// at the identity proxy in front of the application.
pub async fn login(State(state): State<Arc<AppState>>) -> Html<String> {
    let body = "<h2>Sign in</h2>\n\
                <p>Sign in through your organisation's identity provider, \
                then return to <a href=\"/\">the home page</a>.</p>\n";
    Html(page(&state.title, body))
}

/// # GET /users/create
pub async fn user_form(
    State(state): State<Arc<AppState>>,
    scope: RequestScope,
) -> Result<Html<String>, AppError> {
    scope.require_page(MANAGE_USERS).await?;
    let body = "<h2>Create user</h2>\n\
                <form method=\"post\" action=\"/users/create\">\n\
                <label>Name <input name=\"name\" required></label>\n\
                <label>Email <input name=\"email\" type=\"email\" required></label>\n\
                <label>Password <input name=\"password\" type=\"password\" required></label>\n\
                <button type=\"submit\">Create</button>\n\
                </form>\n";
    Ok(Html(page(&state.title, body)))
}

/// The fields posted by the user form.
#[derive(Deserialize)]
pub struct CreateUserForm {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// # POST /users/create
pub async fn create_user(
    scope: RequestScope,
    DbSession(session): DbSession,
    Form(form): Form<CreateUserForm>,
) -> Result<Response, AppError> {
    let creator = scope.require_page(MANAGE_USERS).await?;
    let name = form.name.trim();
    let email = form.email.trim();
    if name.is_empty() || !email.contains('@') || form.password.is_empty() {
        return Err(AppError::BadRequest(
            "a name, a valid email and a password are required".to_string(),
        ));
    }
    if find_user_by_name(&session, name).await?.is_some() {
        return Err(AppError::BadRequest(format!("user '{name}' already exists")));
    }

    let id = session.insert(NewUser::new(name, email, &form.password)?).await?;
    tracing::info!(
        user = name,
        %id,
        created_by = ?creator.user.as_ref().map(|user| user.id),
        "Created user."
    );
    Ok(Redirect::to("/").into_response())
}

/// # GET /api/timeseries
pub async fn timeseries(
    scope: RequestScope,
    DbSession(session): DbSession,
) -> Result<Json<Vec<Timeseries>>, AppError> {
    scope.require(READ).await?;
    let rows = session.query::<Timeseries>().all().await?;
    Ok(Json(rows))
}

/// # GET /api/depthseries
pub async fn depthseries(
    scope: RequestScope,
    DbSession(session): DbSession,
) -> Result<Json<Vec<Depthseries>>, AppError> {
    scope.require(READ).await?;
    let rows = session.query::<Depthseries>().all().await?;
    Ok(Json(rows))
}

/// # GET /api/activities
pub async fn activities(
    scope: RequestScope,
    DbSession(session): DbSession,
) -> Result<Json<Vec<Activity>>, AppError> {
    scope.require(READ).await?;
    let rows = session.query::<Activity>().order_by("started_at").all().await?;
    Ok(Json(rows))
}

/// # GET /api/health
pub async fn health() -> &'static str {
    "OK"
}

fn page(title: &str, body: &str) -> String {
    let title = escape_html(title);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{title}</title>\n\
         <link rel=\"stylesheet\" href=\"/static/theme.css\">\n</head>\n<body>\n\
         <h1>{title}</h1>\n{body}</body>\n</html>\n"
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

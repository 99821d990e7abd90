//! The user management pages against a live PostgreSQL server.
//!
//! Set `CASEINTERVIEW_TEST_DATABASE_URL` to a disposable database to run
//! them; without it every test returns immediately. The scenario drops and
//! recreates the application tables.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use configuration::Settings;
use database::models::find_user_by_name;
use database::{SeedOptions, TransactionManager, get_tm_session, initialize_db};
use std::sync::Arc;
use tower::ServiceExt;
use web_server::{LOGIN_PATH, build_router, configure};

const URL_VAR: &str = "CASEINTERVIEW_TEST_DATABASE_URL";

fn as_admin(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-remote-user", "admin")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn admins_manage_users_through_the_identity_header() {
    let Ok(url) = std::env::var(URL_VAR) else {
        eprintln!("{URL_VAR} is not set; skipping");
        return;
    };
    let mut settings: Settings = [
        ("sqlalchemy.url", url.as_str()),
        ("auth.trusted_header", "x-remote-user"),
    ]
    .into_iter()
    .collect();
    let state = Arc::new(configure(&mut settings, |_| None).unwrap());
    let options = SeedOptions {
        drop_all: true,
        ..SeedOptions::default()
    };
    initialize_db(&state.metadata, &state.session_factory, &options).await.unwrap();
    let app = build_router(state.clone());

    // Anonymous visitors are sent to the login page.
    let anonymous = Request::builder().uri("/users/create").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], LOGIN_PATH);

    // The seeded admin sees and reaches user management.
    let response = app.clone().oneshot(as_admin("GET", "/", Body::empty())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let home = body_text(response).await;
    assert!(home.contains("<h1>Case Interview</h1>"));
    assert!(home.contains("User Management"));

    let response = app
        .clone()
        .oneshot(as_admin("GET", "/users/create", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A created user is committed with the request; a duplicate is refused.
    let form = Body::from("name=carol&email=carol%40vanoord.com&password=s3cret");
    let response = app.clone().oneshot(as_admin("POST", "/users/create", form)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let form = Body::from("name=carol&email=other%40vanoord.com&password=x");
    let response = app.clone().oneshot(as_admin("POST", "/users/create", form)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let tm = TransactionManager::new();
    let session = get_tm_session(&state.session_factory, &tm).await.unwrap();
    let carol = find_user_by_name(&session, "carol").await.unwrap().unwrap();
    assert_eq!(carol.email, "carol@vanoord.com");
    assert!(carol.verify_password("s3cret"));
    tm.commit().await.unwrap();

    let engine = state.session_factory.engine().clone();
    state.metadata.drop_all(&engine).await.unwrap();
    engine.dispose().await;
}

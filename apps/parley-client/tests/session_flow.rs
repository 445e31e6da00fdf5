use std::time::Duration;

use parley_client::{
    ApiRequest, HttpTransport, SessionController, SessionError, SessionStatus, SessionTransport,
    TransportError,
};
use parley_server::{build_router, AppConfig};
use reqwest::StatusCode;
use tokio::net::TcpListener;

async fn spawn_server() -> (String, tokio::task::JoinHandle<()>) {
    let app = build_router(&AppConfig {
        request_timeout: Duration::from_secs(5),
        rate_limit_requests_per_minute: 500,
        secure_cookies: false,
        upload_root: std::env::temp_dir().join(format!(
            "parley-client-tests-{}",
            std::process::id()
        )),
        ..AppConfig::default()
    })
    .expect("router should build");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("server should run without errors");
    });
    (format!("http://{addr}"), server)
}

#[tokio::test]
async fn stale_token_is_renewed_through_the_refresh_cookie() {
    let (base_url, server) = spawn_server().await;
    let transport = HttpTransport::new(&base_url).expect("base url should parse");
    let session = transport
        .register("session_user@example.test", "session_user", "hunter22")
        .await
        .expect("registration should succeed");
    assert!(transport.has_refresh_credential());

    let controller = SessionController::new(transport);
    controller.install_token(String::from("not-a-valid-token"));

    let response = controller
        .execute(ApiRequest::get("/auth/me"))
        .await
        .expect("request should recover");
    assert_eq!(response.status, StatusCode::OK);
    let me: serde_json::Value = response.json().expect("profile should decode");
    assert_eq!(me["user_id"], session.user.user_id.as_str());
    assert_eq!(me["email"], "session_user@example.test");
    assert_ne!(controller.token().as_deref(), Some("not-a-valid-token"));
    assert_eq!(*controller.status().borrow(), SessionStatus::Active);
    server.abort();
}

#[tokio::test]
async fn login_by_email_restores_a_session() {
    let (base_url, server) = spawn_server().await;
    let first = HttpTransport::new(&base_url).expect("base url should parse");
    first
        .register("returning@example.test", "returning", "hunter22")
        .await
        .expect("registration should succeed");

    let transport = HttpTransport::new(&base_url).expect("base url should parse");
    assert_eq!(
        transport.login("returning", "hunter22").await.err(),
        Some(TransportError::Rejected(401))
    );
    let session = transport
        .login("returning@example.test", "hunter22")
        .await
        .expect("login should succeed");
    assert_eq!(session.user.username, "returning");
    assert_eq!(session.user.email, "returning@example.test");
    assert!(transport.has_refresh_credential());
    server.abort();
}

#[tokio::test]
async fn revoked_refresh_credential_ends_the_session() {
    let (base_url, server) = spawn_server().await;
    let transport = HttpTransport::new(&base_url).expect("base url should parse");
    transport
        .register("ended_user@example.test", "ended_user", "hunter22")
        .await
        .expect("registration should succeed");
    transport.logout().await.expect("logout should succeed");

    let controller = SessionController::new(transport);
    controller.install_token(String::from("not-a-valid-token"));
    let outcome = controller.execute(ApiRequest::get("/rooms")).await;
    assert_eq!(outcome, Err(SessionError::SessionEnded));
    assert_eq!(controller.token(), None);
    assert_eq!(*controller.status().borrow(), SessionStatus::Ended);
    assert!(controller.transport().renew().await.is_err());
    server.abort();
}

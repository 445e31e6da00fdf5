use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use futures_util::{SinkExt, StreamExt};
use parley_server::{build_router, AppConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;
use ulid::Ulid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, serde::Deserialize)]
struct AuthResponse {
    access_token: String,
    user: UserRef,
}

#[derive(Debug, serde::Deserialize)]
struct UserRef {
    user_id: String,
}

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        max_body_bytes: 1024 * 32,
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 500,
        upload_root: std::env::temp_dir().join(format!("parley-gateway-tests-{}", Ulid::new())),
        ..AppConfig::default()
    })
    .expect("router should build")
}

async fn parse_json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

async fn register(app: &axum::Router, username: &str) -> AuthResponse {
    let request = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.20")
        .body(Body::from(
            json!({
                "email": format!("{username}@example.test"),
                "username": username,
                "password": "hunter22",
            })
            .to_string(),
        ))
        .expect("register request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("register request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    parse_json_body(response).await
}

async fn get_json(app: &axum::Router, uri: &str, token: &str) -> Value {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("x-forwarded-for", "203.0.113.20")
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should execute");
    assert_eq!(response.status(), StatusCode::OK, "{uri}");
    parse_json_body(response).await
}

async fn create_room(app: &axum::Router, token: &str, name: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/rooms")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.20")
        .body(Body::from(json!({"name": name}).to_string()))
        .expect("create room request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("create room request should execute");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = parse_json_body(response).await;
    body["room_id"]
        .as_str()
        .expect("room id should exist")
        .to_owned()
}

async fn serve(app: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
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
    (addr.to_string(), server)
}

async fn connect(addr: &str, token: &str) -> (Socket, Value) {
    let mut request = format!("ws://{addr}/gateway/ws?access_token={token}")
        .into_client_request()
        .expect("websocket request should build");
    request.headers_mut().insert(
        "x-forwarded-for",
        http::HeaderValue::from_static("203.0.113.20"),
    );
    let (mut socket, _response) = connect_async(request)
        .await
        .expect("websocket handshake should succeed");
    let ready = next_text_event(&mut socket).await;
    assert_eq!(ready["t"], "ready");
    (socket, ready)
}

async fn next_text_event(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("event should arrive in time")
            .expect("socket should stay open")
            .expect("event should decode");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("event should be valid json");
        }
    }
}

async fn send(socket: &mut Socket, event_type: &str, data: Value) {
    let frame = json!({"v": 1, "t": event_type, "d": data}).to_string();
    socket
        .send(Message::Text(frame.into()))
        .await
        .expect("frame should send");
}

#[tokio::test]
async fn unauthenticated_upgrade_is_rejected_with_401() {
    let app = test_app();
    let (addr, server) = serve(app).await;

    let Err(error) = connect_async(format!("ws://{addr}/gateway/ws")).await else {
        panic!("handshake without a token should fail");
    };
    match error {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("unexpected handshake error: {other:?}"),
    }

    let Err(error) = connect_async(format!("ws://{addr}/gateway/ws?access_token=forged")).await
    else {
        panic!("handshake with a forged token should fail");
    };
    assert!(matches!(error, tungstenite::Error::Http(_)));
    server.abort();
}

#[tokio::test]
async fn presence_is_announced_once_per_user_not_per_connection() {
    let app = test_app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (addr, server) = serve(app.clone()).await;

    let (mut bob_socket, _) = connect(&addr, &bob.access_token).await;
    let (mut alice_first, _) = connect(&addr, &alice.access_token).await;
    let online = next_text_event(&mut bob_socket).await;
    assert_eq!(online["t"], "presence_online");
    assert_eq!(online["d"]["user_id"], alice.user.user_id.as_str());

    let (mut alice_second, _) = connect(&addr, &alice.access_token).await;
    create_room(&app, &alice.access_token, "after-second-tab").await;
    let next = next_text_event(&mut bob_socket).await;
    assert_eq!(next["t"], "room_created");

    alice_first.close(None).await.expect("close should succeed");
    tokio::time::sleep(Duration::from_millis(200)).await;
    create_room(&app, &alice.access_token, "after-first-close").await;
    let next = next_text_event(&mut bob_socket).await;
    assert_eq!(next["t"], "room_created");

    alice_second.close(None).await.expect("close should succeed");
    let offline = next_text_event(&mut bob_socket).await;
    assert_eq!(offline["t"], "presence_offline");
    assert_eq!(offline["d"]["user_id"], alice.user.user_id.as_str());

    let users = get_json(&app, "/users", &bob.access_token).await;
    let alice_row = users["users"]
        .as_array()
        .expect("users should be a list")
        .iter()
        .find(|user| user["user_id"] == alice.user.user_id.as_str())
        .expect("alice should be listed")
        .clone();
    assert_eq!(alice_row["is_online"], false);
    server.abort();
}

#[tokio::test]
async fn room_messages_reach_every_member_and_land_in_history() {
    let app = test_app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (addr, server) = serve(app.clone()).await;

    let (mut bob_socket, ready) = connect(&addr, &bob.access_token).await;
    let general = ready["d"]["room_ids"][0]
        .as_str()
        .expect("bob should be in the default room")
        .to_owned();
    let (mut alice_socket, _) = connect(&addr, &alice.access_token).await;
    assert_eq!(next_text_event(&mut bob_socket).await["t"], "presence_online");

    send(
        &mut alice_socket,
        "room_message_send",
        json!({"room_id": general, "body": ""}),
    )
    .await;
    send(
        &mut alice_socket,
        "room_message_send",
        json!({"room_id": general, "body": "hello room"}),
    )
    .await;

    for socket in [&mut alice_socket, &mut bob_socket] {
        let message = next_text_event(socket).await;
        assert_eq!(message["t"], "room_message");
        assert_eq!(message["d"]["body"], "hello room");
        assert_eq!(message["d"]["sender"]["user_id"], alice.user.user_id.as_str());
    }

    let history = get_json(
        &app,
        &format!("/rooms/{general}/messages"),
        &bob.access_token,
    )
    .await;
    let messages = history["messages"].as_array().expect("messages list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["origin"], "room");
    server.abort();
}

#[tokio::test]
async fn direct_messages_reach_both_parties_and_track_unread() {
    let app = test_app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (addr, server) = serve(app.clone()).await;

    let (mut bob_socket, _) = connect(&addr, &bob.access_token).await;
    let (mut alice_socket, _) = connect(&addr, &alice.access_token).await;
    assert_eq!(next_text_event(&mut bob_socket).await["t"], "presence_online");

    send(
        &mut alice_socket,
        "direct_message_send",
        json!({"receiver_id": bob.user.user_id, "body": "psst"}),
    )
    .await;
    for socket in [&mut alice_socket, &mut bob_socket] {
        let message = next_text_event(socket).await;
        assert_eq!(message["t"], "direct_message");
        assert_eq!(message["d"]["body"], "psst");
        assert_eq!(message["d"]["receiver_id"], bob.user.user_id.as_str());
        assert_eq!(message["d"]["read"], false);
    }

    let unread = get_json(&app, "/users/unread", &bob.access_token).await;
    assert_eq!(unread["counts"][0]["sender_id"], alice.user.user_id.as_str());
    assert_eq!(unread["counts"][0]["count"], 1);

    let conversation = get_json(
        &app,
        &format!("/users/{}/messages", alice.user.user_id),
        &bob.access_token,
    )
    .await;
    assert_eq!(conversation["messages"][0]["read"], true);

    let unread = get_json(&app, "/users/unread", &bob.access_token).await;
    assert_eq!(unread["counts"].as_array().map(Vec::len), Some(0));
    server.abort();
}

#[tokio::test]
async fn typing_is_relayed_to_others_but_not_the_typist() {
    let app = test_app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (addr, server) = serve(app.clone()).await;

    let (mut bob_socket, ready) = connect(&addr, &bob.access_token).await;
    let general = ready["d"]["room_ids"][0]
        .as_str()
        .expect("bob should be in the default room")
        .to_owned();
    let (mut alice_socket, _) = connect(&addr, &alice.access_token).await;
    assert_eq!(next_text_event(&mut bob_socket).await["t"], "presence_online");

    send(&mut alice_socket, "typing_start", json!({"room_id": general})).await;
    let started = next_text_event(&mut bob_socket).await;
    assert_eq!(started["t"], "typing_start");
    assert_eq!(started["d"]["user_id"], alice.user.user_id.as_str());
    assert_eq!(started["d"]["username"], "alice");

    send(
        &mut alice_socket,
        "room_message_send",
        json!({"room_id": general, "body": "done typing"}),
    )
    .await;
    let own = next_text_event(&mut alice_socket).await;
    assert_eq!(own["t"], "room_message");

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(next_text_event(&mut bob_socket).await["t"].clone());
    }
    assert!(seen.contains(&Value::from("room_message")));
    assert!(seen.contains(&Value::from("typing_stop")));
    server.abort();
}

#[tokio::test]
async fn leaving_a_room_stops_its_fanout() {
    let app = test_app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let room_id = create_room(&app, &alice.access_token, "leavers").await;
    let (addr, server) = serve(app.clone()).await;

    let join = Request::builder()
        .method("POST")
        .uri(format!("/rooms/{room_id}/join"))
        .header("authorization", format!("Bearer {}", bob.access_token))
        .header("x-forwarded-for", "203.0.113.20")
        .body(Body::empty())
        .expect("join request should build");
    assert_eq!(
        app.clone().oneshot(join).await.expect("join should run").status(),
        StatusCode::NO_CONTENT
    );

    let (mut bob_socket, ready) = connect(&addr, &bob.access_token).await;
    assert!(ready["d"]["room_ids"]
        .as_array()
        .expect("room ids")
        .contains(&Value::from(room_id.as_str())));
    let (mut alice_socket, _) = connect(&addr, &alice.access_token).await;
    assert_eq!(next_text_event(&mut bob_socket).await["t"], "presence_online");

    let leave = Request::builder()
        .method("DELETE")
        .uri(format!("/rooms/{room_id}/leave"))
        .header("authorization", format!("Bearer {}", bob.access_token))
        .header("x-forwarded-for", "203.0.113.20")
        .body(Body::empty())
        .expect("leave request should build");
    assert_eq!(
        app.clone().oneshot(leave).await.expect("leave should run").status(),
        StatusCode::NO_CONTENT
    );

    send(
        &mut alice_socket,
        "room_message_send",
        json!({"room_id": room_id, "body": "anyone here?"}),
    )
    .await;
    assert_eq!(next_text_event(&mut alice_socket).await["t"], "room_message");

    create_room(&app, &alice.access_token, "marker").await;
    assert_eq!(next_text_event(&mut bob_socket).await["t"], "room_created");
    server.abort();
}

//! End-to-end tests for HTTP mocks.

mod common;

use common::{definition, free_port, launch, write_file, TO_UPPER};
use kuro_mock::runtime::HttpHandler;
use kuro_mock::{ProtocolHandler, StartError};
use reqwest::{Method, StatusCode};

const GREETING: &str = r#"
protocol: http
port: PORT
import:
  - EXT
context:
  variables:
    nombre: gatito
routes:
  - path: /hola
    method: GET
    response:
      status: 200
      headers:
        Content-Type: text/plain
        X-Name: "{{context.nombre}}"
      body: "{{> toUpper context.nombre}}"
  - path: /echo
    method: POST
    response:
      status: 201
      body: "hello {{input.name}}"
  - path: /echo
    method: PUT
    response:
      status: 202
      body: "replaced"
"#;

async fn greeting_server() -> (kuro_mock::MockServer, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ext = write_file(dir.path(), "toUpper.kurof", TO_UPPER);
    let port = free_port();
    let def = definition(&GREETING.replace("EXT", &ext), port);
    let server = launch(&def).await;
    (server, format!("http://127.0.0.1:{port}"), dir)
}

#[tokio::test]
async fn test_route_renders_extension() {
    let (mut server, base, _dir) = greeting_server().await;

    let resp = reqwest::get(format!("{base}/hola")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-name"], "gatito");
    assert_eq!(resp.headers()["content-type"], "text/plain");
    assert_eq!(resp.text().await.unwrap(), "GATITO");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_path_and_wrong_method() {
    let (mut server, base, _dir) = greeting_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/missing")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client.delete(format!("{base}/hola")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.text().await.unwrap(), "Method not allowed\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_paths_are_literal_with_subtrees() {
    let port = free_port();
    let def = definition(
        r#"
protocol: http
port: PORT
routes:
  - path: "/users/:id"
    response:
      body: colon
  - path: /files/
    response:
      body: tree
"#,
        port,
    );
    let mut server = launch(&def).await;
    let base = format!("http://127.0.0.1:{port}");

    let resp = reqwest::get(format!("{base}/users/:id")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "colon");

    let resp = reqwest::get(format!("{base}/users/42")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = reqwest::get(format!("{base}/files/a/b.txt")).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "tree");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_methods_share_a_path() {
    let (mut server, base, _dir) = greeting_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/echo"))
        .json(&serde_json::json!({"name": "neko"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.text().await.unwrap(), "hello neko");

    let resp = client.put(format!("{base}/echo")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = client
        .post(format!("{base}/echo"))
        .header("content-type", "text/plain")
        .body("name=neko")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "hello ");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_default_health_endpoints() {
    let (mut server, base, _dir) = greeting_server().await;
    let client = reqwest::Client::new();

    for path in ["/health", "/healthz"] {
        let resp = client.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
    }

    let resp = client.head(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .request(Method::OPTIONS, format!("{base}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()["access-control-allow-methods"], "GET,HEAD,OPTIONS");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_user_route_replaces_health() {
    let port = free_port();
    let def = definition(
        r#"
protocol: http
port: PORT
routes:
  - path: /health
    response:
      status: 503
      body: down
"#,
        port,
    );
    let mut server = launch(&def).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.text().await.unwrap(), "down");

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_templated_path_and_body_error() {
    let port = free_port();
    let def = definition(
        r#"
protocol: http
port: PORT
context:
  variables:
    version: v2
routes:
  - path: "/api/{{version}}/items"
    response:
      status: 200
      body: "{{> notRegistered}}"
"#,
        port,
    );
    let mut server = launch(&def).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/v2/items")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "template rendering failed");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_port_in_use_fails_start() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let def = definition(
        "protocol: http\nport: PORT\nroutes:\n  - path: /x\n    response:\n      body: x\n",
        port,
    );

    let mut handler = HttpHandler::new(common::local_settings());
    let err = handler.start(&def).await.unwrap_err();
    assert!(matches!(err, StartError::Bind { port: p, .. } if p == port));
    assert!(handler.local_addr().is_none());
}

#[tokio::test]
async fn test_stop_releases_port() {
    let port = free_port();
    let def = definition(
        "protocol: http\nport: PORT\nroutes:\n  - path: /x\n    response:\n      body: x\n",
        port,
    );

    let mut handler = HttpHandler::new(common::local_settings());
    tokio_test::assert_ok!(handler.start(&def).await);
    assert!(matches!(
        handler.start(&def).await,
        Err(StartError::AlreadyRunning)
    ));
    tokio_test::assert_ok!(handler.stop().await);
    assert!(handler.local_addr().is_none());

    // Same port can be taken again once stopped
    tokio_test::assert_ok!(handler.start(&def).await);
    tokio_test::assert_ok!(handler.stop().await);
}

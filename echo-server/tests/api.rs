use std::sync::Arc;

use axum::http::{self, Request, StatusCode};
use echo_server::{app_with_sink, MemorySink, HELLO, MAX_BODY_BYTES};
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn request(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::HOST, "server:18888")
        .body(body.to_string())
        .unwrap()
}

fn setup() -> (MemorySink, axum::Router) {
    let sink = MemorySink::new();
    let app = app_with_sink(Arc::new(sink.clone()));
    (sink, app)
}

// --- response ---

#[tokio::test]
async fn every_request_gets_hello() {
    for (method, uri) in [("GET", "/"), ("HEAD", "/"), ("POST", "/anything"), ("DELETE", "/x/y")] {
        let (_, app) = setup();
        let resp = app.oneshot(request(method, uri, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{method} {uri}");
        assert_eq!(
            resp.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        if method != "HEAD" {
            assert_eq!(body_bytes(resp).await, HELLO.as_bytes());
        }
    }
}

// --- capture ---

#[tokio::test]
async fn query_appears_in_request_line() {
    let (sink, app) = setup();
    app.oneshot(request("GET", "/?query=hello+world", "")).await.unwrap();
    let dump = sink.last().unwrap();
    assert!(dump.starts_with("GET /?query=hello+world HTTP/1.1\r\nHost: server:18888\r\n"), "{dump}");
}

#[tokio::test]
async fn delete_dump_has_empty_body() {
    let (sink, app) = setup();
    app.oneshot(request("DELETE", "/", "")).await.unwrap();
    let dump = sink.last().unwrap();
    let (head, body) = dump.split_once("\r\n\r\n").unwrap();
    assert_eq!(head.split(' ').next(), Some("DELETE"));
    assert!(body.is_empty());
}

#[tokio::test]
async fn form_body_is_captured() {
    let (sink, app) = setup();
    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body("test=value".to_string())
        .unwrap();
    app.oneshot(req).await.unwrap();
    let dump = sink.last().unwrap();
    assert!(dump.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(dump.ends_with("\r\n\r\ntest=value"));
}

#[tokio::test]
async fn each_request_is_captured_independently() {
    let (sink, app) = setup();
    app.clone().oneshot(request("GET", "/one", "")).await.unwrap();
    app.oneshot(request("GET", "/two", "")).await.unwrap();
    let texts = sink.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].starts_with("GET /one "));
    assert!(texts[1].starts_with("GET /two "));
}

// --- errors ---

#[tokio::test]
async fn oversized_body_is_500_and_not_captured() {
    let (sink, app) = setup();
    let big = "x".repeat(MAX_BODY_BYTES + 1);
    let resp = app.oneshot(request("POST", "/", &big)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_bytes(resp).await.is_empty());
    assert!(sink.dumps().is_empty());
}

// --- live ---

#[test]
fn serves_over_tcp() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let sink = MemorySink::new();
    let server_sink = sink.clone();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            echo_server::run_with_sink(listener, Arc::new(server_sink)).await
        })
        .unwrap();
    });

    let mut response = ureq::get(&format!("http://{addr}/?query=hello+world")).call().unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.body_mut().read_to_string().unwrap(), HELLO);

    let dump = sink.last().unwrap();
    assert!(dump.starts_with("GET /?query=hello+world HTTP/1.1\r\n"), "{dump}");
    assert!(dump.contains(&format!("Host: {addr}\r\n")));
}

//! End-to-end request scenarios driven through `App::serve_request`.

use bytes::Bytes;
use eudore::{App, Context, Error};
use http::StatusCode;
use http::header::{ALLOW, CONTENT_TYPE, VARY};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

fn request(method: &str, uri: &str) -> http::request::Builder {
    http::Request::builder().method(method).uri(uri)
}

fn empty(b: http::request::Builder) -> http::Request<Full<Bytes>> {
    b.body(Full::new(Bytes::new())).unwrap()
}

async fn send(app: &App, req: http::Request<Full<Bytes>>) -> (StatusCode, http::HeaderMap, Bytes) {
    let res = app.serve_request(req, None).await;
    let (parts, body) = res.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

// ── Basic route ───────────────────────────────────────────────────────────────

async fn hello(ctx: &mut Context) {
    ctx.write_string("hi");
}

#[tokio::test]
async fn basic_route() {
    let app = App::new();
    app.router().get("/hello", hello);

    let (status, headers, body) = send(&app, empty(request("GET", "/hello"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hi");
    assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
}

// ── Param + validator ─────────────────────────────────────────────────────────

async fn show_params(ctx: &mut Context) -> Value {
    json!({
        "id": ctx.get_param("id"),
        "action": ctx.get_param("action"),
        "route": ctx.get_param("route"),
    })
}

#[tokio::test]
async fn param_with_validator() {
    let app = App::new();
    app.router().get("/users/:id|min=1 action=show", show_params);

    let req = empty(request("GET", "/users/42").header("accept", "application/json"));
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let got: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(got, json!({"id": "42", "action": "show", "route": "/users/:id|min=1"}));

    let (status, _, _) = send(&app, empty(request("GET", "/users/0"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── 405 with Allow ────────────────────────────────────────────────────────────

#[tokio::test]
async fn method_not_allowed_lists_allow() {
    let app = App::new();
    app.router().get("/x", hello).post("/x", hello);

    let (status, headers, _) = send(&app, empty(request("PUT", "/x"))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers[ALLOW], "GET, POST");
}

// ── Bind + validate ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct NewUser {
    #[serde(rename = "Name")]
    name: String,
}

async fn create_user(ctx: &mut Context) {
    match ctx.bind::<NewUser>().await {
        Ok(user) => {
            if let Err(err) = ctx.render(&user) {
                ctx.fatal(err);
            }
        }
        Err(err) => ctx.fatal(err),
    }
}

#[tokio::test]
async fn bind_then_validate_fails_with_400() {
    let app = App::new();
    app.validator().register::<NewUser>(&[("Name", "nozero")]);
    app.router().post("/u", create_user);

    let req = request("POST", "/u")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(br#"{"Name":""}"#)))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let msg = serde_json::from_slice::<Value>(&body).unwrap()["message"].as_str().unwrap().to_owned();
    assert!(msg.contains("Name") && msg.contains("nozero"), "{msg}");

    let req = request("POST", "/u")
        .header(CONTENT_TYPE, "application/json")
        .header("accept", "application/json")
        .body(Full::new(Bytes::from_static(br#"{"Name":"bob"}"#)))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"Name":"bob"}"#);
}

#[tokio::test]
async fn unsupported_content_type_is_415() {
    let app = App::new();
    app.router().post("/u", create_user);

    let req = request("POST", "/u")
        .header(CONTENT_TYPE, "text/csv")
        .body(Full::new(Bytes::from_static(b"a,b")))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

// ── Accept JSON indent ────────────────────────────────────────────────────────

async fn data(_ctx: &mut Context) -> Result<Value, Error> {
    Ok(json!({"a": 1}))
}

#[tokio::test]
async fn html_accept_falls_back_to_pretty_json() {
    let app = App::new();
    app.router().get("/j", data);

    let req = empty(request("GET", "/j").header("accept", "text/html"));
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[CONTENT_TYPE], "application/json; charset=utf-8");
    assert_eq!(headers[VARY], "Accept");
    assert_eq!(body, "{\n\t\"a\": 1\n}\n");
}

// ── Host routing and groups ───────────────────────────────────────────────────

async fn api(_ctx: &mut Context) -> &'static str {
    "api"
}

#[tokio::test]
async fn host_routes_and_groups() {
    let app = App::new();
    let router = app.router();
    router.get("/ host=*.example.com", api).get("/", hello);
    router.group("/v1 version=1").get("/ping", show_params);

    let (_, _, body) = send(&app, empty(request("GET", "/").header("host", "api.example.com:8080"))).await;
    assert_eq!(body, "api");
    let (_, _, body) = send(&app, empty(request("GET", "/").header("host", "other.org"))).await;
    assert_eq!(body, "hi");

    let (status, _, body) = send(&app, empty(request("GET", "/v1/ping").header("accept", "application/json"))).await;
    assert_eq!(status, StatusCode::OK);
    let got: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(got["route"], "/v1/ping");
}

// ── Middleware ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn global_middleware_sees_not_found() {
    let app = App::new();
    app.add_middleware([eudore::middleware::request_id()]);
    app.router().get("/hello", hello);

    let (status, headers, _) = send(&app, empty(request("GET", "/nope").header("x-request-id", "req-1"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["x-request-id"], "req-1");
}

//! Transcoding tests driven straight through the router, no listener.

use std::sync::Arc;

use http::header::{ACCEPT, CONTENT_TYPE};
use http_body_util::BodyExt;
use prost::Message;
use prost_reflect::MethodDescriptor;
use serde_json::json;
use tower::ServiceExt;

use axum::body::Body;
use gantry_proto::greet::{HelloRequest, HelloResponse};
use gantry_serve::{EvalError, Evaluator, EvaluatorFn, RuleTemplate, Server, ServerConfig};

fn greet_evaluator() -> Arc<dyn Evaluator> {
    Arc::new(EvaluatorFn(
        |method: &MethodDescriptor, input: String| -> Result<String, EvalError> {
            let input: serde_json::Value = serde_json::from_str(&input)?;
            let name = input["request"]["firstName"].as_str().unwrap_or_default();
            let reply = match method.name() {
                "Hello" | "HelloGet" => {
                    if name == "Bart" {
                        json!({"status": {"code": 3, "message": "eat my shorts"}})
                    } else {
                        json!({"response": {"greeting": format!("Hello {name}")}})
                    }
                }
                "HelloServerStream" => json!({"stream": [{"greeting": format!("Hello {name}")}]}),
                other => return Err(format!("unexpected method {other}").into()),
            };
            Ok(reply.to_string())
        },
    ))
}

fn router(templates: Vec<RuleTemplate>) -> axum::Router {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("greet.pb"),
        gantry_proto::greet::FILE_DESCRIPTOR_SET,
    )
    .unwrap();
    let config = ServerConfig {
        dirs: vec![dir.path().to_path_buf()],
        http: true,
        rule_templates: templates,
        ..ServerConfig::default()
    };
    Server::new(config, greet_evaluator()).unwrap().router()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn transcodes_json_request_and_response() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("POST")
        .uri("/api/greet/hello")
        .header(CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(r#"{"first_name": "Stranger"}"#))
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["greeting"], "Hello Stranger");
}

#[tokio::test]
async fn negotiates_binary_response() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("POST")
        .uri("/api/greet/hello")
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/x-protobuf; charset=utf-8")
        .body(Body::from(r#"{"first_name": "Stranger"}"#))
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "application/x-protobuf"
    );
    let decoded = HelloResponse::decode(body_bytes(resp).await.as_slice()).unwrap();
    assert_eq!(decoded.greeting, "Hello Stranger");
}

#[tokio::test]
async fn decodes_binary_request_body() {
    let router = router(Vec::new());
    let msg = HelloRequest {
        first_name: "Stranger".to_owned(),
        last_name: String::new(),
    };
    let req = http::Request::builder()
        .method("POST")
        .uri("/api/greet/hello")
        .header(CONTENT_TYPE, "application/x-protobuf")
        .header(ACCEPT, "application/json")
        .body(Body::from(msg.encode_to_vec()))
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["greeting"], "Hello Stranger");
}

#[tokio::test]
async fn maps_status_to_http_error_with_status_body() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("POST")
        .uri("/api/greet/hello")
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/json")
        .body(Body::from(r#"{"first_name": "Bart"}"#))
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["code"], 3);
    assert_eq!(body["message"], "eat my shorts");
}

#[tokio::test]
async fn path_variable_fills_request_field() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("GET")
        .uri("/api/greet/hello/Lisa")
        .body(Body::empty())
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["greeting"], "Hello Lisa");
}

#[tokio::test]
async fn templated_rule_serves_unannotated_method() {
    let router = router(vec![RuleTemplate::new(
        "POST",
        "/post/{package}.{service}/{method}",
        Some("*"),
    )]);
    let req = http::Request::builder()
        .method("POST")
        .uri("/post/greet.Greeter/HelloServerStream")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"first_name": "Rod"}"#))
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["greeting"], "Hello Rod");
}

#[tokio::test]
async fn unmatched_path_gets_structured_not_found() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("GET")
        .uri("/api/greet/hello") // GET is not bound to this path
        .body(Body::empty())
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["code"], tonic::Code::NotFound as i32);
}

#[tokio::test]
async fn unknown_grpc_method_answers_unimplemented() {
    let router = router(Vec::new());
    let req = http::Request::builder()
        .method("POST")
        .uri("/no.such.Service/Method")
        .header(CONTENT_TYPE, "application/grpc")
        .body(Body::empty())
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(resp.headers().get("grpc-status").unwrap(), "12");
    let message = resp
        .headers()
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(message.contains("no.such.Service.Method"));
}
